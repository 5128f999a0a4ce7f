//! Tool input DTOs and the response envelope
//!
//! Every input derives `JsonSchema` so rmcp can publish the tool schemas.
//! Defaults follow the Outlook web conventions (10 messages per page,
//! HTML bodies, sent items saved).

use chrono::{SecondsFormat, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Metadata included in all tool responses
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Meta {
    /// Current UTC timestamp in RFC 3339 format with milliseconds
    pub now_utc: String,
    /// Tool execution duration in milliseconds
    pub duration_ms: u64,
}

impl Meta {
    pub fn now(duration_ms: u64) -> Self {
        Self {
            now_utc: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            duration_ms,
        }
    }
}

/// Standard response envelope for all tools
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ToolEnvelope<T>
where
    T: JsonSchema,
{
    /// Human-readable summary of the operation outcome
    pub summary: String,
    /// Graph payload (or tool-specific data)
    pub data: T,
    pub meta: Meta,
}

/// Input: list messages in a folder
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ListMailInput {
    /// Folder alias (`inbox`, `sent`, `drafts`, `deleted`, `junk`, `archive`, `outbox`) or folder id
    #[serde(default = "default_folder")]
    pub folder: String,
    /// Messages to return (1..50, default 10)
    #[serde(default = "default_mail_top")]
    pub top: u32,
    /// Messages to skip for paging
    #[serde(default)]
    pub skip: u32,
    /// OData `$filter` expression, e.g. `isRead eq false`
    pub filter: Option<String>,
    /// Free-text `$search` query
    pub search: Option<String>,
    /// Comma-separated `$select` fields
    pub select: Option<String>,
}

/// Input: fetch one message
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct GetMailInput {
    pub message_id: String,
    /// Include the message body (default true)
    #[serde(default = "default_true")]
    pub include_body: bool,
}

/// Input: compose and send a message
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct SendMailInput {
    /// Recipient addresses
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub bcc: Vec<String>,
    /// `low`, `normal` or `high`
    #[serde(default = "default_importance")]
    pub importance: String,
    /// Treat `body` as HTML (default true)
    #[serde(default = "default_true")]
    pub is_html: bool,
    /// Keep a copy in Sent Items (default true)
    #[serde(default = "default_true")]
    pub save_to_sent: bool,
}

/// Input: create a draft without sending
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct CreateDraftInput {
    #[serde(default)]
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub bcc: Vec<String>,
    #[serde(default = "default_importance")]
    pub importance: String,
    #[serde(default = "default_true")]
    pub is_html: bool,
}

/// Input: reply to a message
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ReplyMailInput {
    pub message_id: String,
    /// Reply text
    pub comment: String,
    /// Reply to all recipients
    #[serde(default)]
    pub reply_all: bool,
}

/// Input: move a message to another folder
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct MoveMailInput {
    pub message_id: String,
    /// Folder alias or folder id
    pub destination_folder: String,
}

/// Input: update message state
///
/// At least one of `is_read`, `categories`, `flag_status` is required.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct UpdateMailInput {
    pub message_id: String,
    pub is_read: Option<bool>,
    pub categories: Option<Vec<String>>,
    /// `notFlagged`, `flagged` or `complete`
    pub flag_status: Option<String>,
}

/// Input: paging size only
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ListFoldersInput {
    /// Folders to return (1..50, default 20)
    #[serde(default = "default_folder_top")]
    pub top: u32,
}

/// Input: calendar view over a date range
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ListEventsInput {
    /// Range start (`YYYY-MM-DD` or ISO 8601; default today)
    pub start_date: Option<String>,
    /// Range end (`YYYY-MM-DD` or ISO 8601; default today + 7 days)
    pub end_date: Option<String>,
    /// Events to return (1..50, default 20)
    #[serde(default = "default_event_top")]
    pub top: u32,
    /// Specific calendar; default calendar when omitted
    pub calendar_id: Option<String>,
}

/// Input: a single event id
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct EventIdInput {
    pub event_id: String,
}

/// Input: create an event
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct CreateEventInput {
    pub subject: String,
    /// ISO 8601 local date-time, e.g. `2025-03-01T09:00:00`
    pub start: String,
    pub end: String,
    /// IANA or Windows time zone name (default `UTC`)
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// HTML body
    pub body: Option<String>,
    pub location: Option<String>,
    /// Required attendee addresses
    #[serde(default)]
    pub attendees: Vec<String>,
    /// Create a Teams meeting
    #[serde(default)]
    pub is_online_meeting: bool,
    /// Reminder lead time in minutes (default 15)
    #[serde(default = "default_reminder")]
    pub reminder_minutes: u32,
    #[serde(default)]
    pub is_all_day: bool,
    /// `daily`, `weekly` or `monthly`
    pub recurrence: Option<String>,
    pub calendar_id: Option<String>,
}

/// Input: update or cancel an event
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct UpdateEventInput {
    pub event_id: String,
    pub subject: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
    /// Time zone for `start`/`end` (default `UTC`)
    pub timezone: Option<String>,
    pub location: Option<String>,
    pub body: Option<String>,
    /// Cancel the meeting and notify attendees (organizer only)
    #[serde(default)]
    pub is_cancelled: bool,
}

/// Input: answer a meeting invitation
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct RespondEventInput {
    pub event_id: String,
    /// `accept`, `tentativelyAccept` or `decline`
    pub response: String,
    pub comment: Option<String>,
    /// Send the response to the organizer (default true)
    #[serde(default = "default_true")]
    pub send_response: bool,
}

/// Input: paging size only
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ListCalendarsInput {
    /// Calendars to return (1..50, default 10)
    #[serde(default = "default_calendar_top")]
    pub top: u32,
}

/// Input: a single message id
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct MessageIdInput {
    pub message_id: String,
}

/// Input: download one attachment to disk
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct GetAttachmentInput {
    pub message_id: String,
    pub attachment_id: String,
    /// File name override; the attachment's own name when omitted
    pub filename: Option<String>,
}

/// Output of `outlook_get_attachment`
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SavedAttachment {
    pub attachment_id: String,
    /// Attachment name as reported by Graph
    pub name: String,
    pub content_type: Option<String>,
    /// Absolute path of the written file
    pub path: String,
    pub size_bytes: u64,
}

fn default_true() -> bool {
    true
}

fn default_folder() -> String {
    "inbox".to_owned()
}

fn default_importance() -> String {
    "normal".to_owned()
}

fn default_timezone() -> String {
    "UTC".to_owned()
}

fn default_mail_top() -> u32 {
    10
}

fn default_folder_top() -> u32 {
    20
}

fn default_event_top() -> u32 {
    20
}

fn default_calendar_top() -> u32 {
    10
}

fn default_reminder() -> u32 {
    15
}
