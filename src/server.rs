//! MCP server implementation with tool handlers
//!
//! Implements the `ServerHandler` trait and registers 18 Outlook tools over
//! Microsoft Graph. Handlers validate arguments, build the Graph request,
//! and wrap the Graph JSON in a [`ToolEnvelope`].

use std::sync::Arc;
use std::time::Instant;

use chrono::{Datelike, Duration as ChronoDuration, NaiveDate, Utc, Weekday};
use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{ErrorData, ServerCapabilities, ServerInfo};
use rmcp::{Json, ServerHandler, tool, tool_handler, tool_router};
use serde_json::{Map, Value, json};

use crate::attachments::AttachmentStore;
use crate::errors::{AppError, AppResult};
use crate::graph::GraphClient;
use crate::models::{
    CreateDraftInput, CreateEventInput, EventIdInput, GetAttachmentInput, GetMailInput,
    ListCalendarsInput, ListEventsInput, ListFoldersInput, ListMailInput, MessageIdInput, Meta,
    MoveMailInput, ReplyMailInput, RespondEventInput, SavedAttachment, SendMailInput,
    ToolEnvelope, UpdateEventInput, UpdateMailInput,
};

/// Maximum page size for list tools
const MAX_TOP: u32 = 50;
/// Default fields for message listings
const MAIL_LIST_SELECT: &str =
    "id,subject,from,receivedDateTime,isRead,importance,hasAttachments,bodyPreview";
/// Fields for a single message (body appended on request)
const MAIL_DETAIL_SELECT: &str = "id,subject,from,toRecipients,ccRecipients,bccRecipients,receivedDateTime,sentDateTime,importance,isRead,hasAttachments,categories,flag,internetMessageHeaders";
const EVENT_LIST_SELECT: &str = "id,subject,start,end,location,organizer,attendees,isOnlineMeeting,showAs,isCancelled,recurrence";
const PROFILE_SELECT: &str =
    "id,displayName,mail,userPrincipalName,jobTitle,officeLocation,mobilePhone,businessPhones";

/// Well-known folder aliases accepted in place of folder ids
const FOLDER_ALIASES: [(&str, &str); 11] = [
    ("inbox", "inbox"),
    ("sentitems", "sentItems"),
    ("sent", "sentItems"),
    ("drafts", "drafts"),
    ("deleteditems", "deletedItems"),
    ("deleted", "deletedItems"),
    ("trash", "deletedItems"),
    ("junkemail", "junkEmail"),
    ("junk", "junkEmail"),
    ("archive", "archive"),
    ("outbox", "outbox"),
];

/// Outlook MCP server
///
/// Cheap to clone; the Graph client and attachment store are shared.
#[derive(Clone)]
pub struct OutlookServer {
    graph: Arc<GraphClient>,
    attachments: Arc<AttachmentStore>,
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl OutlookServer {
    pub fn new(graph: Arc<GraphClient>, attachments: Arc<AttachmentStore>) -> Self {
        Self {
            graph,
            attachments,
            tool_router: Self::tool_router(),
        }
    }

    #[tool(
        name = "outlook_list_mail",
        description = "List messages in a mail folder, newest first, with optional OData filter or search",
        annotations(
            title = "List Mail",
            read_only_hint = true,
            destructive_hint = false,
            idempotent_hint = true,
            open_world_hint = true
        )
    )]
    async fn list_mail(
        &self,
        Parameters(input): Parameters<ListMailInput>,
    ) -> Result<Json<ToolEnvelope<Value>>, ErrorData> {
        let started = Instant::now();
        let folder = input.folder.clone();
        finalize_tool(
            started,
            self.list_mail_impl(input).await.map(|data| {
                (
                    format!("{} message(s) in '{folder}'", count_items(&data)),
                    data,
                )
            }),
        )
    }

    #[tool(
        name = "outlook_get_mail",
        description = "Get one message with recipients, flags, headers and optionally the body",
        annotations(
            title = "Get Mail",
            read_only_hint = true,
            destructive_hint = false,
            idempotent_hint = true,
            open_world_hint = true
        )
    )]
    async fn get_mail(
        &self,
        Parameters(input): Parameters<GetMailInput>,
    ) -> Result<Json<ToolEnvelope<Value>>, ErrorData> {
        let started = Instant::now();
        finalize_tool(
            started,
            self.get_mail_impl(input)
                .await
                .map(|data| ("Message retrieved".to_owned(), data)),
        )
    }

    #[tool(
        name = "outlook_send_mail",
        description = "Compose and send a message",
        annotations(
            title = "Send Mail",
            read_only_hint = false,
            destructive_hint = false,
            idempotent_hint = false,
            open_world_hint = true
        )
    )]
    async fn send_mail(
        &self,
        Parameters(input): Parameters<SendMailInput>,
    ) -> Result<Json<ToolEnvelope<Value>>, ErrorData> {
        let started = Instant::now();
        let recipients = input.to.len();
        finalize_tool(
            started,
            self.send_mail_impl(input)
                .await
                .map(|data| (format!("Message sent to {recipients} recipient(s)"), data)),
        )
    }

    #[tool(
        name = "outlook_create_draft",
        description = "Save a message to Drafts without sending it",
        annotations(
            title = "Create Draft",
            read_only_hint = false,
            destructive_hint = false,
            idempotent_hint = false,
            open_world_hint = true
        )
    )]
    async fn create_draft(
        &self,
        Parameters(input): Parameters<CreateDraftInput>,
    ) -> Result<Json<ToolEnvelope<Value>>, ErrorData> {
        let started = Instant::now();
        finalize_tool(
            started,
            self.create_draft_impl(input)
                .await
                .map(|data| ("Draft created".to_owned(), data)),
        )
    }

    #[tool(
        name = "outlook_reply_mail",
        description = "Reply or reply-all to a message",
        annotations(
            title = "Reply to Mail",
            read_only_hint = false,
            destructive_hint = false,
            idempotent_hint = false,
            open_world_hint = true
        )
    )]
    async fn reply_mail(
        &self,
        Parameters(input): Parameters<ReplyMailInput>,
    ) -> Result<Json<ToolEnvelope<Value>>, ErrorData> {
        let started = Instant::now();
        let mode = if input.reply_all { "Reply-all" } else { "Reply" };
        finalize_tool(
            started,
            self.reply_mail_impl(input)
                .await
                .map(|data| (format!("{mode} sent"), data)),
        )
    }

    #[tool(
        name = "outlook_move_mail",
        description = "Move a message to another folder (alias or folder id)",
        annotations(
            title = "Move Mail",
            read_only_hint = false,
            destructive_hint = true,
            idempotent_hint = false,
            open_world_hint = true
        )
    )]
    async fn move_mail(
        &self,
        Parameters(input): Parameters<MoveMailInput>,
    ) -> Result<Json<ToolEnvelope<Value>>, ErrorData> {
        let started = Instant::now();
        finalize_tool(
            started,
            self.move_mail_impl(input)
                .await
                .map(|data| ("Message moved".to_owned(), data)),
        )
    }

    #[tool(
        name = "outlook_update_mail",
        description = "Mark a message read/unread, set categories, or change its flag",
        annotations(
            title = "Update Mail",
            read_only_hint = false,
            destructive_hint = false,
            idempotent_hint = true,
            open_world_hint = true
        )
    )]
    async fn update_mail(
        &self,
        Parameters(input): Parameters<UpdateMailInput>,
    ) -> Result<Json<ToolEnvelope<Value>>, ErrorData> {
        let started = Instant::now();
        finalize_tool(
            started,
            self.update_mail_impl(input)
                .await
                .map(|data| ("Message updated".to_owned(), data)),
        )
    }

    #[tool(
        name = "outlook_list_folders",
        description = "List mail folders with item and unread counts",
        annotations(
            title = "List Mail Folders",
            read_only_hint = true,
            destructive_hint = false,
            idempotent_hint = true,
            open_world_hint = true
        )
    )]
    async fn list_folders(
        &self,
        Parameters(input): Parameters<ListFoldersInput>,
    ) -> Result<Json<ToolEnvelope<Value>>, ErrorData> {
        let started = Instant::now();
        finalize_tool(
            started,
            self.list_folders_impl(input)
                .await
                .map(|data| (format!("{} folder(s)", count_items(&data)), data)),
        )
    }

    #[tool(
        name = "outlook_list_events",
        description = "List calendar events in a date range (default: today through 7 days out)",
        annotations(
            title = "List Events",
            read_only_hint = true,
            destructive_hint = false,
            idempotent_hint = true,
            open_world_hint = true
        )
    )]
    async fn list_events(
        &self,
        Parameters(input): Parameters<ListEventsInput>,
    ) -> Result<Json<ToolEnvelope<Value>>, ErrorData> {
        let started = Instant::now();
        finalize_tool(
            started,
            self.list_events_impl(input)
                .await
                .map(|data| (format!("{} event(s)", count_items(&data)), data)),
        )
    }

    #[tool(
        name = "outlook_get_event",
        description = "Get one calendar event",
        annotations(
            title = "Get Event",
            read_only_hint = true,
            destructive_hint = false,
            idempotent_hint = true,
            open_world_hint = true
        )
    )]
    async fn get_event(
        &self,
        Parameters(input): Parameters<EventIdInput>,
    ) -> Result<Json<ToolEnvelope<Value>>, ErrorData> {
        let started = Instant::now();
        let result = async {
            validate_id(&input.event_id, "event_id")?;
            self.graph
                .get(&format!("/me/events/{}", seg(&input.event_id)), &[])
                .await
        }
        .await;
        finalize_tool(started, result.map(|data| ("Event retrieved".to_owned(), data)))
    }

    #[tool(
        name = "outlook_create_event",
        description = "Create a calendar event with optional attendees, Teams meeting and recurrence",
        annotations(
            title = "Create Event",
            read_only_hint = false,
            destructive_hint = false,
            idempotent_hint = false,
            open_world_hint = true
        )
    )]
    async fn create_event(
        &self,
        Parameters(input): Parameters<CreateEventInput>,
    ) -> Result<Json<ToolEnvelope<Value>>, ErrorData> {
        let started = Instant::now();
        finalize_tool(
            started,
            self.create_event_impl(input)
                .await
                .map(|data| ("Event created".to_owned(), data)),
        )
    }

    #[tool(
        name = "outlook_update_event",
        description = "Update event fields, or cancel the event when is_cancelled is true",
        annotations(
            title = "Update Event",
            read_only_hint = false,
            destructive_hint = false,
            idempotent_hint = true,
            open_world_hint = true
        )
    )]
    async fn update_event(
        &self,
        Parameters(input): Parameters<UpdateEventInput>,
    ) -> Result<Json<ToolEnvelope<Value>>, ErrorData> {
        let started = Instant::now();
        let summary = if input.is_cancelled {
            "Event cancelled"
        } else {
            "Event updated"
        };
        finalize_tool(
            started,
            self.update_event_impl(input)
                .await
                .map(|data| (summary.to_owned(), data)),
        )
    }

    #[tool(
        name = "outlook_delete_event",
        description = "Delete a calendar event",
        annotations(
            title = "Delete Event",
            read_only_hint = false,
            destructive_hint = true,
            idempotent_hint = true,
            open_world_hint = true
        )
    )]
    async fn delete_event(
        &self,
        Parameters(input): Parameters<EventIdInput>,
    ) -> Result<Json<ToolEnvelope<Value>>, ErrorData> {
        let started = Instant::now();
        let result = async {
            validate_id(&input.event_id, "event_id")?;
            self.graph
                .delete(&format!("/me/events/{}", seg(&input.event_id)))
                .await
        }
        .await;
        finalize_tool(started, result.map(|data| ("Event deleted".to_owned(), data)))
    }

    #[tool(
        name = "outlook_respond_event",
        description = "Accept, tentatively accept, or decline a meeting invitation",
        annotations(
            title = "Respond to Event",
            read_only_hint = false,
            destructive_hint = false,
            idempotent_hint = true,
            open_world_hint = true
        )
    )]
    async fn respond_event(
        &self,
        Parameters(input): Parameters<RespondEventInput>,
    ) -> Result<Json<ToolEnvelope<Value>>, ErrorData> {
        let started = Instant::now();
        finalize_tool(
            started,
            self.respond_event_impl(input)
                .await
                .map(|(action, data)| (format!("Response '{action}' sent"), data)),
        )
    }

    #[tool(
        name = "outlook_list_calendars",
        description = "List the user's calendars",
        annotations(
            title = "List Calendars",
            read_only_hint = true,
            destructive_hint = false,
            idempotent_hint = true,
            open_world_hint = true
        )
    )]
    async fn list_calendars(
        &self,
        Parameters(input): Parameters<ListCalendarsInput>,
    ) -> Result<Json<ToolEnvelope<Value>>, ErrorData> {
        let started = Instant::now();
        let result = async {
            validate_top(input.top)?;
            self.graph
                .get(
                    "/me/calendars",
                    &[
                        query("$top", input.top),
                        query("$select", "id,name,color,isDefaultCalendar,canEdit,owner"),
                    ],
                )
                .await
        }
        .await;
        finalize_tool(
            started,
            result.map(|data| (format!("{} calendar(s)", count_items(&data)), data)),
        )
    }

    #[tool(
        name = "outlook_get_profile",
        description = "Get the signed-in user's profile",
        annotations(
            title = "Get Profile",
            read_only_hint = true,
            destructive_hint = false,
            idempotent_hint = true,
            open_world_hint = true
        )
    )]
    async fn get_profile(&self) -> Result<Json<ToolEnvelope<Value>>, ErrorData> {
        let started = Instant::now();
        let result = self
            .graph
            .get("/me", &[query("$select", PROFILE_SELECT)])
            .await;
        finalize_tool(
            started,
            result.map(|data| {
                let name = data["displayName"].as_str().unwrap_or("unknown user");
                (format!("Profile for {name}"), data)
            }),
        )
    }

    #[tool(
        name = "outlook_list_attachments",
        description = "List attachments of a message (id, name, content type, size)",
        annotations(
            title = "List Attachments",
            read_only_hint = true,
            destructive_hint = false,
            idempotent_hint = true,
            open_world_hint = true
        )
    )]
    async fn list_attachments(
        &self,
        Parameters(input): Parameters<MessageIdInput>,
    ) -> Result<Json<ToolEnvelope<Value>>, ErrorData> {
        let started = Instant::now();
        let result = async {
            validate_id(&input.message_id, "message_id")?;
            self.graph
                .get(
                    &format!("/me/messages/{}/attachments", seg(&input.message_id)),
                    &[query("$select", "id,name,contentType,size,isInline")],
                )
                .await
        }
        .await;
        finalize_tool(
            started,
            result.map(|data| (format!("{} attachment(s)", count_items(&data)), data)),
        )
    }

    #[tool(
        name = "outlook_get_attachment",
        description = "Download an attachment into the attachment directory and return its path",
        annotations(
            title = "Save Attachment",
            read_only_hint = false,
            destructive_hint = false,
            idempotent_hint = false,
            open_world_hint = true
        )
    )]
    async fn get_attachment(
        &self,
        Parameters(input): Parameters<GetAttachmentInput>,
    ) -> Result<Json<ToolEnvelope<SavedAttachment>>, ErrorData> {
        let started = Instant::now();
        finalize_tool(
            started,
            self.get_attachment_impl(input).await.map(|data| {
                (
                    format!("Saved {} ({} bytes)", data.path, data.size_bytes),
                    data,
                )
            }),
        )
    }
}

/// MCP server handler implementation
#[tool_handler(router = self.tool_router)]
impl ServerHandler for OutlookServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo::new(ServerCapabilities::builder().enable_tools().build()).with_instructions(
            "Outlook mail and calendar over Microsoft Graph. If a tool reports auth_required, run `outlook-mcp-rs auth` once to sign in.",
        )
    }
}

/// Tool implementation methods
impl OutlookServer {
    async fn list_mail_impl(&self, input: ListMailInput) -> AppResult<Value> {
        validate_top(input.top)?;
        validate_id(&input.folder, "folder")?;
        let folder = resolve_folder(&input.folder);

        let mut params = vec![
            query("$top", input.top),
            query(
                "$select",
                input.select.as_deref().unwrap_or(MAIL_LIST_SELECT),
            ),
        ];
        if let Some(filter) = input.filter.as_deref() {
            validate_no_controls(filter, "filter")?;
            params.push(query("$filter", filter));
        }
        match input.search.as_deref() {
            Some(search) => {
                // Graph rejects $orderby and $skip alongside $search
                validate_no_controls(search, "search")?;
                params.push(query("$search", format!("\"{}\"", search.replace('"', ""))));
            }
            None => {
                params.push(query("$skip", input.skip));
                params.push(query("$orderby", "receivedDateTime desc"));
            }
        }

        self.graph
            .get(&format!("/me/mailFolders/{}/messages", seg(&folder)), &params)
            .await
    }

    async fn get_mail_impl(&self, input: GetMailInput) -> AppResult<Value> {
        validate_id(&input.message_id, "message_id")?;
        let mut select = MAIL_DETAIL_SELECT.to_owned();
        if input.include_body {
            select.push_str(",body,bodyPreview");
        }
        self.graph
            .get(
                &format!("/me/messages/{}", seg(&input.message_id)),
                &[query("$select", select)],
            )
            .await
    }

    async fn send_mail_impl(&self, input: SendMailInput) -> AppResult<Value> {
        if input.to.is_empty() {
            return Err(AppError::invalid("to must contain at least one recipient"));
        }
        let message = build_message(MessageDraft {
            to: &input.to,
            cc: &input.cc,
            bcc: &input.bcc,
            subject: &input.subject,
            body: &input.body,
            importance: &input.importance,
            is_html: input.is_html,
        })?;
        self.graph
            .post(
                "/me/sendMail",
                &json!({ "message": message, "saveToSentItems": input.save_to_sent }),
            )
            .await
    }

    async fn create_draft_impl(&self, input: CreateDraftInput) -> AppResult<Value> {
        let message = build_message(MessageDraft {
            to: &input.to,
            cc: &input.cc,
            bcc: &input.bcc,
            subject: &input.subject,
            body: &input.body,
            importance: &input.importance,
            is_html: input.is_html,
        })?;
        self.graph.post("/me/messages", &message).await
    }

    async fn reply_mail_impl(&self, input: ReplyMailInput) -> AppResult<Value> {
        validate_id(&input.message_id, "message_id")?;
        let action = if input.reply_all { "replyAll" } else { "reply" };
        self.graph
            .post(
                &format!("/me/messages/{}/{action}", seg(&input.message_id)),
                &json!({ "comment": input.comment }),
            )
            .await
    }

    async fn move_mail_impl(&self, input: MoveMailInput) -> AppResult<Value> {
        validate_id(&input.message_id, "message_id")?;
        validate_id(&input.destination_folder, "destination_folder")?;
        self.graph
            .post(
                &format!("/me/messages/{}/move", seg(&input.message_id)),
                &json!({ "destinationId": resolve_folder(&input.destination_folder) }),
            )
            .await
    }

    async fn update_mail_impl(&self, input: UpdateMailInput) -> AppResult<Value> {
        validate_id(&input.message_id, "message_id")?;
        let mut updates = Map::new();
        if let Some(is_read) = input.is_read {
            updates.insert("isRead".to_owned(), json!(is_read));
        }
        if let Some(categories) = &input.categories {
            for c in categories {
                validate_no_controls(c, "categories")?;
            }
            updates.insert("categories".to_owned(), json!(categories));
        }
        if let Some(status) = input.flag_status.as_deref() {
            updates.insert(
                "flag".to_owned(),
                json!({ "flagStatus": normalize_flag_status(status)? }),
            );
        }
        if updates.is_empty() {
            return Err(AppError::invalid(
                "at least one of is_read, categories or flag_status is required",
            ));
        }
        self.graph
            .patch(
                &format!("/me/messages/{}", seg(&input.message_id)),
                &Value::Object(updates),
            )
            .await
    }

    async fn list_folders_impl(&self, input: ListFoldersInput) -> AppResult<Value> {
        validate_top(input.top)?;
        self.graph
            .get(
                "/me/mailFolders",
                &[
                    query("$top", input.top),
                    query("$select", "id,displayName,totalItemCount,unreadItemCount"),
                ],
            )
            .await
    }

    async fn list_events_impl(&self, input: ListEventsInput) -> AppResult<Value> {
        validate_top(input.top)?;
        let today = Utc::now().date_naive();
        let start = match input.start_date.as_deref() {
            Some(s) => pad_range_bound(s, "start_date", "T00:00:00")?,
            None => format!("{}T00:00:00", today.format("%Y-%m-%d")),
        };
        let end = match input.end_date.as_deref() {
            Some(s) => pad_range_bound(s, "end_date", "T23:59:59")?,
            None => format!(
                "{}T23:59:59",
                (today + ChronoDuration::days(7)).format("%Y-%m-%d")
            ),
        };
        let base = match input.calendar_id.as_deref() {
            Some(id) => {
                validate_id(id, "calendar_id")?;
                format!("/me/calendars/{}", seg(id))
            }
            None => "/me".to_owned(),
        };

        let mut data = self
            .graph
            .get(
                &format!("{base}/calendarView"),
                &[
                    query("startDateTime", start),
                    query("endDateTime", end),
                    query("$top", input.top),
                    query("$orderby", "start/dateTime"),
                    query("$select", EVENT_LIST_SELECT),
                ],
            )
            .await?;
        drop_cancelled_events(&mut data);
        Ok(data)
    }

    async fn create_event_impl(&self, input: CreateEventInput) -> AppResult<Value> {
        validate_no_controls(&input.subject, "subject")?;
        let start_date = parse_date_prefix(&input.start, "start")?;
        parse_date_prefix(&input.end, "end")?;
        validate_no_controls(&input.timezone, "timezone")?;
        validate_recipients(&input.attendees, "attendees")?;

        let mut event = json!({
            "subject": input.subject,
            "start": { "dateTime": input.start, "timeZone": input.timezone },
            "end": { "dateTime": input.end, "timeZone": input.timezone },
            "isOnlineMeeting": input.is_online_meeting,
            "isAllDay": input.is_all_day,
            "reminderMinutesBeforeStart": input.reminder_minutes,
        });
        if let Some(body) = input.body.as_deref() {
            event["body"] = json!({ "contentType": "HTML", "content": body });
        }
        if let Some(location) = input.location.as_deref() {
            event["location"] = json!({ "displayName": location });
        }
        if !input.attendees.is_empty() {
            event["attendees"] = Value::Array(
                input
                    .attendees
                    .iter()
                    .map(|a| json!({ "emailAddress": { "address": a }, "type": "required" }))
                    .collect(),
            );
        }
        if input.is_online_meeting {
            event["onlineMeetingProvider"] = json!("teamsForBusiness");
        }
        if let Some(kind) = input.recurrence.as_deref() {
            event["recurrence"] = json!({
                "pattern": recurrence_pattern(kind, start_date)?,
                "range": { "type": "noEnd", "startDate": start_date.format("%Y-%m-%d").to_string() },
            });
        }

        let path = match input.calendar_id.as_deref() {
            Some(id) => {
                validate_id(id, "calendar_id")?;
                format!("/me/calendars/{}/events", seg(id))
            }
            None => "/me/events".to_owned(),
        };
        self.graph.post(&path, &event).await
    }

    async fn update_event_impl(&self, input: UpdateEventInput) -> AppResult<Value> {
        validate_id(&input.event_id, "event_id")?;
        let path = format!("/me/events/{}", seg(&input.event_id));
        if input.is_cancelled {
            return self.graph.post(&format!("{path}/cancel"), &json!({})).await;
        }

        let timezone = input.timezone.as_deref().unwrap_or("UTC");
        let mut updates = Map::new();
        if let Some(subject) = input.subject {
            updates.insert("subject".to_owned(), json!(subject));
        }
        if let Some(start) = input.start {
            parse_date_prefix(&start, "start")?;
            updates.insert(
                "start".to_owned(),
                json!({ "dateTime": start, "timeZone": timezone }),
            );
        }
        if let Some(end) = input.end {
            parse_date_prefix(&end, "end")?;
            updates.insert(
                "end".to_owned(),
                json!({ "dateTime": end, "timeZone": timezone }),
            );
        }
        if let Some(location) = input.location {
            updates.insert("location".to_owned(), json!({ "displayName": location }));
        }
        if let Some(body) = input.body {
            updates.insert(
                "body".to_owned(),
                json!({ "contentType": "HTML", "content": body }),
            );
        }
        if updates.is_empty() {
            return Err(AppError::invalid(
                "no updates given; set a field or is_cancelled=true",
            ));
        }
        self.graph.patch(&path, &Value::Object(updates)).await
    }

    async fn respond_event_impl(
        &self,
        input: RespondEventInput,
    ) -> AppResult<(&'static str, Value)> {
        validate_id(&input.event_id, "event_id")?;
        let action = normalize_response(&input.response)?;
        let mut payload = json!({ "sendResponse": input.send_response });
        if let Some(comment) = input.comment {
            payload["comment"] = json!(comment);
        }
        let data = self
            .graph
            .post(
                &format!("/me/events/{}/{action}", seg(&input.event_id)),
                &payload,
            )
            .await?;
        Ok((action, data))
    }

    async fn get_attachment_impl(&self, input: GetAttachmentInput) -> AppResult<SavedAttachment> {
        validate_id(&input.message_id, "message_id")?;
        validate_id(&input.attachment_id, "attachment_id")?;
        let base = format!(
            "/me/messages/{}/attachments/{}",
            seg(&input.message_id),
            seg(&input.attachment_id)
        );

        let meta = self
            .graph
            .get(&base, &[query("$select", "id,name,contentType,size")])
            .await?;
        let name = meta["name"].as_str().unwrap_or("attachment").to_owned();
        let content_type = meta["contentType"].as_str().map(str::to_owned);

        let bytes = self.graph.download(&format!("{base}/$value")).await?;
        let target = input.filename.as_deref().unwrap_or(&name);
        let stored = self.attachments.save(target, &bytes).await?;

        Ok(SavedAttachment {
            attachment_id: input.attachment_id,
            name,
            content_type,
            path: stored.path.display().to_string(),
            size_bytes: stored.size_bytes,
        })
    }
}

fn duration_ms(started: Instant) -> u64 {
    started.elapsed().as_millis().min(u128::from(u64::MAX)) as u64
}

fn finalize_tool<T>(
    started: Instant,
    result: AppResult<(String, T)>,
) -> Result<Json<ToolEnvelope<T>>, ErrorData>
where
    T: schemars::JsonSchema,
{
    match result {
        Ok((summary, data)) => Ok(Json(ToolEnvelope {
            summary,
            data,
            meta: Meta::now(duration_ms(started)),
        })),
        Err(e) => Err(e.to_error_data()),
    }
}

struct MessageDraft<'a> {
    to: &'a [String],
    cc: &'a [String],
    bcc: &'a [String],
    subject: &'a str,
    body: &'a str,
    importance: &'a str,
    is_html: bool,
}

/// Graph `message` resource for send and draft
fn build_message(draft: MessageDraft<'_>) -> AppResult<Value> {
    validate_recipients(draft.to, "to")?;
    validate_recipients(draft.cc, "cc")?;
    validate_recipients(draft.bcc, "bcc")?;
    validate_no_controls(draft.subject, "subject")?;
    let importance = normalize_importance(draft.importance)?;

    let mut message = json!({
        "subject": draft.subject,
        "body": {
            "contentType": if draft.is_html { "HTML" } else { "Text" },
            "content": draft.body,
        },
        "toRecipients": recipients(draft.to),
        "importance": importance,
    });
    if !draft.cc.is_empty() {
        message["ccRecipients"] = recipients(draft.cc);
    }
    if !draft.bcc.is_empty() {
        message["bccRecipients"] = recipients(draft.bcc);
    }
    Ok(message)
}

fn recipients(addresses: &[String]) -> Value {
    Value::Array(
        addresses
            .iter()
            .map(|a| json!({ "emailAddress": { "address": a.trim() } }))
            .collect(),
    )
}

fn query(key: &str, value: impl ToString) -> (String, String) {
    (key.to_owned(), value.to_string())
}

/// Percent-encode an id for use as one path segment
fn seg(id: &str) -> String {
    urlencoding::encode(id.trim()).into_owned()
}

fn resolve_folder(folder: &str) -> String {
    let key = folder.trim().to_ascii_lowercase();
    FOLDER_ALIASES
        .iter()
        .find(|(alias, _)| *alias == key)
        .map(|(_, id)| (*id).to_owned())
        .unwrap_or_else(|| folder.trim().to_owned())
}

fn count_items(data: &Value) -> usize {
    data["value"].as_array().map_or(0, Vec::len)
}

fn drop_cancelled_events(data: &mut Value) {
    if let Some(events) = data.get_mut("value").and_then(Value::as_array_mut) {
        events.retain(|e| !e["isCancelled"].as_bool().unwrap_or(false));
    }
}

/// Bare dates get `suffix`; date-times pass through
fn pad_range_bound(value: &str, field: &str, suffix: &str) -> AppResult<String> {
    let value = value.trim();
    parse_date_prefix(value, field)?;
    if value.contains('T') {
        Ok(value.to_owned())
    } else {
        Ok(format!("{value}{suffix}"))
    }
}

/// Parse the leading `YYYY-MM-DD` of an ISO 8601 value
fn parse_date_prefix(value: &str, field: &str) -> AppResult<NaiveDate> {
    validate_no_controls(value, field)?;
    value
        .trim()
        .get(..10)
        .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
        .ok_or_else(|| {
            AppError::invalid(format!(
                "{field} must be an ISO 8601 date or date-time (YYYY-MM-DD...)"
            ))
        })
}

fn recurrence_pattern(kind: &str, start: NaiveDate) -> AppResult<Value> {
    match kind.trim().to_ascii_lowercase().as_str() {
        "daily" => Ok(json!({ "type": "daily", "interval": 1 })),
        "weekly" => Ok(json!({
            "type": "weekly",
            "interval": 1,
            "daysOfWeek": [weekday_name(start.weekday())],
        })),
        "monthly" => Ok(json!({
            "type": "absoluteMonthly",
            "interval": 1,
            "dayOfMonth": start.day(),
        })),
        other => Err(AppError::invalid(format!(
            "recurrence must be one of daily, weekly, monthly (got '{other}')"
        ))),
    }
}

fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "monday",
        Weekday::Tue => "tuesday",
        Weekday::Wed => "wednesday",
        Weekday::Thu => "thursday",
        Weekday::Fri => "friday",
        Weekday::Sat => "saturday",
        Weekday::Sun => "sunday",
    }
}

fn normalize_response(response: &str) -> AppResult<&'static str> {
    match response.trim().to_ascii_lowercase().as_str() {
        "accept" => Ok("accept"),
        "tentativelyaccept" | "tentative" => Ok("tentativelyAccept"),
        "decline" => Ok("decline"),
        _ => Err(AppError::invalid(
            "response must be one of accept, tentativelyAccept, decline",
        )),
    }
}

fn normalize_importance(importance: &str) -> AppResult<&'static str> {
    match importance.trim().to_ascii_lowercase().as_str() {
        "low" => Ok("low"),
        "normal" => Ok("normal"),
        "high" => Ok("high"),
        _ => Err(AppError::invalid("importance must be one of low, normal, high")),
    }
}

fn normalize_flag_status(status: &str) -> AppResult<&'static str> {
    match status.trim().to_ascii_lowercase().as_str() {
        "notflagged" => Ok("notFlagged"),
        "flagged" => Ok("flagged"),
        "complete" => Ok("complete"),
        _ => Err(AppError::invalid(
            "flag_status must be one of notFlagged, flagged, complete",
        )),
    }
}

fn validate_top(top: u32) -> AppResult<()> {
    validate_chars(top as usize, 1, MAX_TOP as usize, "top")
}

fn validate_id(value: &str, field: &str) -> AppResult<()> {
    if value.trim().is_empty() {
        return Err(AppError::invalid(format!("{field} must not be empty")));
    }
    validate_no_controls(value, field)
}

fn validate_recipients(addresses: &[String], field: &str) -> AppResult<()> {
    for address in addresses {
        validate_no_controls(address, field)?;
        let address = address.trim();
        let valid = address
            .split_once('@')
            .is_some_and(|(local, domain)| !local.is_empty() && domain.contains('.'));
        if !valid {
            return Err(AppError::invalid(format!(
                "{field} contains an invalid email address: '{address}'"
            )));
        }
    }
    Ok(())
}

fn validate_no_controls(value: &str, field: &str) -> AppResult<()> {
    if value.chars().any(|ch| ch.is_ascii_control()) {
        return Err(AppError::InvalidInput(format!(
            "{field} must not contain control characters"
        )));
    }
    Ok(())
}

fn validate_chars(value: usize, min: usize, max: usize, field: &str) -> AppResult<()> {
    if value < min || value > max {
        return Err(AppError::InvalidInput(format!(
            "{field} must be in range {min}..{max}"
        )));
    }
    Ok(())
}
