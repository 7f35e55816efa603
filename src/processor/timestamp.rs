//! `wsu:Timestamp` creation and validation.

use crate::chain::{ProcessingUnit, UnitContext, UnitId};
use crate::error::WssError;
use crate::event::{text_element, ElementStart, StreamEvent};
use crate::ns::{self, attr, node, WSU_NS};
use crate::secure_part::DocumentTracker;
use crate::security_event::SecurityEvent;
use crate::xml::Element;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use tracing::{debug, warn};

/// Injects a timestamp as the first child of the security header.
#[derive(Debug)]
pub struct TimestampUnit {
    ttl: Duration,
    tracker: DocumentTracker,
}

impl TimestampUnit {
    pub fn new(ttl_secs: i64) -> Self {
        Self {
            ttl: Duration::seconds(ttl_secs),
            tracker: DocumentTracker::new(),
        }
    }
}

impl ProcessingUnit for TimestampUnit {
    fn id(&self) -> UnitId {
        UnitId::Timestamp
    }

    fn transform(&mut self, event: StreamEvent, ctx: &mut UnitContext<'_>) -> Result<Vec<StreamEvent>, WssError> {
        match &event {
            StreamEvent::ElementStart(start) => self.tracker.enter(start),
            StreamEvent::ElementEnd(_) => {
                self.tracker.leave();
                return Ok(vec![event]);
            }
            StreamEvent::Characters(_) => return Ok(vec![event]),
        }
        if !self.tracker.is_security_header() {
            return Ok(vec![event]);
        }

        let created = Utc::now();
        let expires = created + self.ttl;
        let id = ctx.message.generate_id("TS");
        let name = ns::wsu(node::TIMESTAMP);

        let mut out = vec![
            event,
            StreamEvent::ElementStart(ElementStart::new(name.clone()).with_attribute(ns::wsu(attr::ID), id.clone())),
        ];
        out.extend(text_element(ns::wsu(node::CREATED), format_instant(created)));
        out.extend(text_element(ns::wsu(node::EXPIRES), format_instant(expires)));
        out.push(StreamEvent::end(name));

        debug!(timestamp_id = %id, %created, %expires, "Added timestamp");
        ctx.message.publish(SecurityEvent::Timestamp {
            created,
            expires: Some(expires),
        });
        ctx.remove_self();
        Ok(out)
    }
}

/// Validates the timestamp of an inbound security header.
#[derive(Debug)]
pub struct TimestampVerifyUnit {
    max_age: Duration,
    future_skew: Duration,
    tracker: DocumentTracker,
    buffer: Option<Vec<StreamEvent>>,
    seen: bool,
}

impl TimestampVerifyUnit {
    pub fn new(max_age_secs: i64, future_skew_secs: i64) -> Self {
        Self {
            max_age: Duration::seconds(max_age_secs),
            future_skew: Duration::seconds(future_skew_secs),
            tracker: DocumentTracker::new(),
            buffer: None,
            seen: false,
        }
    }

    fn check(&mut self, events: &[StreamEvent], ctx: &mut UnitContext<'_>) -> Result<(), WssError> {
        let timestamp = Element::from_events(events)?;
        let created = timestamp
            .child(WSU_NS, node::CREATED)
            .ok_or_else(|| WssError::Structural("wsu:Timestamp without wsu:Created".to_string()))
            .and_then(|c| parse_instant(&c.text()))?;
        let expires = timestamp
            .child(WSU_NS, node::EXPIRES)
            .map(|e| parse_instant(&e.text()))
            .transpose()?;
        validate(created, expires, Utc::now(), self.max_age, self.future_skew)?;

        ctx.message.publish(SecurityEvent::Timestamp { created, expires });
        Ok(())
    }
}

impl ProcessingUnit for TimestampVerifyUnit {
    fn id(&self) -> UnitId {
        UnitId::TimestampVerify
    }

    fn transform(&mut self, event: StreamEvent, ctx: &mut UnitContext<'_>) -> Result<Vec<StreamEvent>, WssError> {
        match &event {
            StreamEvent::ElementStart(start) => {
                self.tracker.enter(start);
                if self.buffer.is_none()
                    && start.name.is(WSU_NS, node::TIMESTAMP)
                    && self.tracker.depth() == 4
                    && self.tracker.in_security_header()
                {
                    if self.seen {
                        return Err(WssError::Structural(
                            "security header carries more than one timestamp".to_string(),
                        ));
                    }
                    self.seen = true;
                    self.buffer = Some(Vec::new());
                }
                if let Some(buffer) = self.buffer.as_mut() {
                    buffer.push(event.clone());
                }
            }
            StreamEvent::ElementEnd(name) => {
                if let Some(buffer) = self.buffer.as_mut() {
                    buffer.push(event.clone());
                    if self.tracker.depth() == 4 && name.is(WSU_NS, node::TIMESTAMP) {
                        let events = self.buffer.take().unwrap_or_default();
                        self.check(&events, ctx)?;
                    }
                }
                self.tracker.leave();
            }
            StreamEvent::Characters(_) => {
                if let Some(buffer) = self.buffer.as_mut() {
                    buffer.push(event.clone());
                }
            }
        }
        Ok(vec![event])
    }

    fn finalize(&mut self, _ctx: &mut UnitContext<'_>) -> Result<Vec<StreamEvent>, WssError> {
        if !self.seen {
            return Err(WssError::Structural("expected wsu:Timestamp not found".to_string()));
        }
        Ok(Vec::new())
    }
}

/// Check a timestamp against `now`.
pub fn validate(
    created: DateTime<Utc>,
    expires: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    max_age: Duration,
    future_skew: Duration,
) -> Result<(), WssError> {
    if created > now + future_skew {
        warn!(%created, %now, "Timestamp created in the future");
        return Err(WssError::MessageExpired(format!("created {} is in the future", created)));
    }
    if now - created > max_age {
        return Err(WssError::MessageExpired(format!(
            "created {} is older than {} seconds",
            created,
            max_age.num_seconds()
        )));
    }
    if let Some(expires) = expires {
        if expires < created {
            return Err(WssError::Structural("timestamp expires before it was created".to_string()));
        }
        if now > expires + future_skew {
            return Err(WssError::MessageExpired(format!("expired at {}", expires)));
        }
    }
    Ok(())
}

fn format_instant(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_instant(text: &str) -> Result<DateTime<Utc>, WssError> {
    DateTime::parse_from_rfc3339(text.trim())
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| WssError::Structural(format!("invalid timestamp '{}': {}", text.trim(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        parse_instant(s).unwrap()
    }

    #[test]
    fn test_fresh_timestamp_accepted() {
        let now = at("2024-05-01T12:00:10Z");
        let result = validate(
            at("2024-05-01T12:00:00Z"),
            Some(at("2024-05-01T12:05:00Z")),
            now,
            Duration::seconds(300),
            Duration::seconds(60),
        );
        assert!(result.is_ok());
    }

    #[test]
    fn test_expired_timestamp() {
        let result = validate(
            at("2024-05-01T12:00:00Z"),
            Some(at("2024-05-01T12:01:00Z")),
            at("2024-05-01T12:03:00Z"),
            Duration::seconds(300),
            Duration::seconds(60),
        );
        assert!(matches!(result, Err(WssError::MessageExpired(_))));
    }

    #[test]
    fn test_too_old() {
        let result = validate(
            at("2024-05-01T12:00:00Z"),
            None,
            at("2024-05-01T13:00:00Z"),
            Duration::seconds(300),
            Duration::seconds(60),
        );
        assert!(matches!(result, Err(WssError::MessageExpired(_))));
    }

    #[test]
    fn test_created_in_future() {
        let result = validate(
            at("2024-05-01T12:10:00Z"),
            None,
            at("2024-05-01T12:00:00Z"),
            Duration::seconds(300),
            Duration::seconds(60),
        );
        assert!(matches!(result, Err(WssError::MessageExpired(_))));
    }

    #[test]
    fn test_format_round_trips() {
        let instant = at("2024-05-01T12:00:00.250Z");
        assert_eq!(format_instant(instant), "2024-05-01T12:00:00.250Z");
        assert_eq!(parse_instant(&format_instant(instant)).unwrap(), instant);
    }
}
