//! Push notification composition.

use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use url::Url;

use crate::config::PushConfig;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationAction {
  pub action: String,
  pub title: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub icon: Option<String>,
}

/// A notification ready to be shown.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
  pub vibrate: Vec<u32>,
  pub data: Map<String, Value>,
  pub actions: Vec<NotificationAction>,
}

/// What to do when a notification (or one of its actions) is clicked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "url", rename_all = "lowercase")]
pub enum ClickTarget {
  /// Open a window at this URL
  Open(Url),
  Dismiss,
}

/// Build a notification from the configured defaults and an optional
/// inbound payload.
///
/// A JSON object payload may override `title` and `body`, and its `data`
/// object is merged over the default data key by key. Anything else is
/// taken verbatim as the body.
pub fn compose(defaults: &PushConfig, payload: Option<&str>) -> Notification {
  let mut data = Map::new();
  data.insert(
    "dateOfArrival".to_string(),
    Value::from(Utc::now().timestamp_millis()),
  );
  data.insert("primaryKey".to_string(), Value::from(1));

  let mut notification = Notification {
    title: defaults.title.clone(),
    body: defaults.body.clone(),
    icon: defaults.icon.clone(),
    badge: defaults.badge.clone(),
    vibrate: defaults.vibrate.clone(),
    data,
    actions: vec![
      NotificationAction {
        action: "explore".to_string(),
        title: "View Details".to_string(),
        icon: Some(defaults.icon.clone()),
      },
      NotificationAction {
        action: "close".to_string(),
        title: "Close".to_string(),
        icon: None,
      },
    ],
  };

  let Some(payload) = payload.filter(|p| !p.trim().is_empty()) else {
    return notification;
  };

  match serde_json::from_str::<Map<String, Value>>(payload) {
    Ok(fields) => {
      if let Some(title) = fields.get("title").and_then(Value::as_str) {
        notification.title = title.to_string();
      }
      if let Some(body) = fields.get("body").and_then(Value::as_str) {
        notification.body = body.to_string();
      }
      if let Some(Value::Object(extra)) = fields.get("data") {
        for (key, value) in extra {
          notification.data.insert(key.clone(), value.clone());
        }
      }
    }
    Err(_) => notification.body = payload.to_string(),
  }

  notification
}

impl Notification {
  /// Resolve a click on `action` (`None` for the notification body).
  pub fn click_target(origin: &Url, action: Option<&str>) -> ClickTarget {
    match action {
      Some("explore") => match origin.join("/") {
        Ok(root) => ClickTarget::Open(root),
        Err(_) => ClickTarget::Dismiss,
      },
      _ => ClickTarget::Dismiss,
    }
  }
}
