//! Presence configuration and the activity publisher.
//!
//! [`PresenceConfig`] is what the embedding application hands the engine.
//! [`build_activity`] projects it onto the wire [`ActivityPayload`]; it is a
//! pure function of the config and an [`ActivityClock`], so every mapping rule
//! is testable without a socket. [`publish`] and [`clear`] wrap the payload in
//! a `SET_ACTIVITY` command and run it through the correlator.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::constants::{COUNTDOWN_DEFAULT, ID_PREFIX};
use crate::correlator::Correlator;
use crate::error::{PresenceError, PresenceResult};
use crate::frame::cmd;
use crate::transport::FrameSender;

/// How the activity timestamps are derived.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampsMode {
    /// `start` is the publish time.
    Elapsed,
    /// `end` is the explicit end timestamp, or one hour from now.
    Countdown,
    /// Explicit `start`/`end` when present.
    Custom,
    /// `start` is when the session reached `Connected`.
    SinceConnection,
    /// `start` is when the client was created.
    SinceAppStart,
    /// No timestamps. Unknown modes land here too.
    #[default]
    #[serde(other)]
    None,
}

/// A clickable activity button.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Button {
    /// Button text.
    pub label: String,
    /// Target URL.
    pub url: String,
}

impl Button {
    fn is_complete(&self) -> bool {
        !self.label.is_empty() && !self.url.is_empty()
    }
}

/// Application-level description of the presence to show.
///
/// Loaded from JSON; every field except `application_id` is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    /// Target application identifier (`client_id`).
    pub application_id: String,
    /// Companion-side id of this configuration, used for the connected
    /// notification.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_id: Option<String>,
    /// First line of the activity.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// Second line of the activity.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    /// Timestamp derivation; also accepted as `timestamps_type`.
    #[serde(alias = "timestamps_type")]
    pub timestamps_mode: TimestampsMode,
    /// Unix seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_timestamp: Option<i64>,
    /// Unix seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_timestamp: Option<i64>,
    /// Asset key of the large image.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub large_image_key: Option<String>,
    /// Hover text of the large image.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub large_image_text: Option<String>,
    /// Asset key of the small image.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub small_image_key: Option<String>,
    /// Hover text of the small image.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub small_image_text: Option<String>,
    /// First button.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub button1: Option<Button>,
    /// Second button.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub button2: Option<Button>,
    /// Current party size.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub party_size: Option<i64>,
    /// Maximum party size.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub party_max: Option<i64>,
    /// Party id; synthesized from the application id when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub party_id: Option<String>,
}

/// Wire timestamps, unix seconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamps {
    /// Activity start.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<i64>,
    /// Activity end, shown as a countdown.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<i64>,
}

/// Wire image assets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assets {
    /// Large image asset key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub large_image: Option<String>,
    /// Large image hover text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub large_text: Option<String>,
    /// Small image asset key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub small_image: Option<String>,
    /// Small image hover text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub small_text: Option<String>,
}

/// Wire party block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Party {
    /// Party identifier.
    pub id: String,
    /// `[current, max]`.
    pub size: [i64; 2],
}

/// The `activity` argument of `SET_ACTIVITY`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityPayload {
    /// First status line.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// Second status line.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    /// Start and end times.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamps: Option<Timestamps>,
    /// Images and their hover texts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assets: Option<Assets>,
    /// At most two link buttons.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buttons: Option<Vec<Button>>,
    /// Party id and size.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub party: Option<Party>,
}

/// Time inputs for one publish, all unix seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivityClock {
    /// Publish time.
    pub now: i64,
    /// When the session reached `Connected`, if it has.
    pub connected_at: Option<i64>,
    /// When the client was created.
    pub app_started_at: i64,
}

impl ActivityClock {
    /// Clock for a publish happening now.
    pub fn now(connected_at: Option<i64>, app_started_at: i64) -> Self {
        Self {
            now: chrono::Utc::now().timestamp(),
            connected_at,
            app_started_at,
        }
    }
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value.filter(|s| !s.is_empty()).cloned()
}

fn timestamps(config: &PresenceConfig, clock: &ActivityClock) -> Option<Timestamps> {
    let positive = |t: Option<i64>| t.filter(|t| *t > 0);
    let ts = match config.timestamps_mode {
        TimestampsMode::Elapsed => Timestamps {
            start: Some(clock.now),
            end: None,
        },
        TimestampsMode::Countdown => {
            let fallback = clock.now + COUNTDOWN_DEFAULT.as_secs() as i64;
            Timestamps {
                start: None,
                end: Some(positive(config.end_timestamp).unwrap_or(fallback)),
            }
        }
        TimestampsMode::Custom => Timestamps {
            start: positive(config.start_timestamp),
            end: positive(config.end_timestamp),
        },
        TimestampsMode::SinceConnection => Timestamps {
            start: clock.connected_at,
            end: None,
        },
        TimestampsMode::SinceAppStart => Timestamps {
            start: Some(clock.app_started_at),
            end: None,
        },
        TimestampsMode::None => return None,
    };
    (ts.start.is_some() || ts.end.is_some()).then_some(ts)
}

fn assets(config: &PresenceConfig) -> Option<Assets> {
    let mut assets = Assets::default();
    if let Some(key) = non_empty(config.large_image_key.as_ref()) {
        assets.large_image = Some(key);
        assets.large_text = non_empty(config.large_image_text.as_ref());
    }
    if let Some(key) = non_empty(config.small_image_key.as_ref()) {
        assets.small_image = Some(key);
        assets.small_text = non_empty(config.small_image_text.as_ref());
    }
    (assets.large_image.is_some() || assets.small_image.is_some()).then_some(assets)
}

fn party(config: &PresenceConfig) -> Option<Party> {
    let size = config.party_size.filter(|n| *n > 0)?;
    let max = config.party_max.filter(|n| *n > 0)?;
    let id = non_empty(config.party_id.as_ref())
        .unwrap_or_else(|| format!("{}_{}", ID_PREFIX, config.application_id));
    Some(Party {
        id,
        size: [size, max],
    })
}

/// Project a config onto the wire activity.
///
/// Empty strings count as absent and empty sub-objects are omitted.
#[must_use]
pub fn build_activity(config: &PresenceConfig, clock: &ActivityClock) -> ActivityPayload {
    let buttons: Vec<Button> = [config.button1.as_ref(), config.button2.as_ref()]
        .into_iter()
        .flatten()
        .filter(|b| b.is_complete())
        .cloned()
        .collect();

    ActivityPayload {
        details: non_empty(config.details.as_ref()),
        state: non_empty(config.state.as_ref()),
        timestamps: timestamps(config, clock),
        assets: assets(config),
        buttons: (!buttons.is_empty()).then_some(buttons),
        party: party(config),
    }
}

/// Arguments for `SET_ACTIVITY`; `None` clears the activity.
#[must_use]
pub fn set_activity_args(pid: u32, activity: Option<&ActivityPayload>) -> Value {
    json!({ "pid": pid, "activity": activity })
}

/// Publish `activity` and wait for the acknowledgement.
///
/// # Errors
///
/// `ActivityPublishFailed` wrapping the rejection or timeout; `Cancelled`
/// passes through untouched.
pub async fn publish(
    correlator: &Correlator,
    sender: &FrameSender,
    activity: &ActivityPayload,
) -> PresenceResult<()> {
    let args = set_activity_args(std::process::id(), Some(activity));
    match correlator.issue(sender, cmd::SET_ACTIVITY, args).await {
        Ok(_) => Ok(()),
        Err(PresenceError::Cancelled) => Err(PresenceError::Cancelled),
        Err(e) => Err(PresenceError::ActivityPublishFailed(e.to_string())),
    }
}

/// Clear the remote activity.
///
/// # Errors
///
/// Same as [`publish`].
pub async fn clear(correlator: &Correlator, sender: &FrameSender) -> PresenceResult<()> {
    let args = set_activity_args(std::process::id(), None);
    correlator
        .issue(sender, cmd::SET_ACTIVITY, args)
        .await
        .map(|_| ())
        .map_err(|e| match e {
            PresenceError::Cancelled => e,
            other => PresenceError::ActivityPublishFailed(other.to_string()),
        })
}
