use async_trait::async_trait;
use chatgate_common::{Error, Result};
use chrono::{FixedOffset, SecondsFormat, Utc};
use serde_json::json;

use crate::tools::{Tool, ToolContext, ToolOutput};

/// Largest UTC offset accepted, in hours.
const MAX_OFFSET_HOURS: f64 = 14.0;

/// Reports the current date and time, optionally shifted to a fixed UTC offset.
pub struct CurrentTime;

#[async_trait]
impl Tool for CurrentTime {
    fn name(&self) -> &str {
        "current_time"
    }

    fn description(&self) -> &str {
        "Get the current date and time. Pass utc_offset_hours (e.g. 2 or -5.5) to get \
         the local time of a specific timezone; defaults to UTC."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "utc_offset_hours": {
                    "type": "number",
                    "description": "Offset from UTC in hours, between -14 and 14."
                }
            }
        })
    }

    async fn execute(&self, _context: &ToolContext, args: serde_json::Value) -> Result<ToolOutput> {
        let hours = match args.get("utc_offset_hours") {
            None | Some(serde_json::Value::Null) => 0.0,
            Some(value) => value.as_f64().ok_or_else(|| {
                Error::Agent("'utc_offset_hours' must be a number".to_string())
            })?,
        };
        if hours.abs() > MAX_OFFSET_HOURS {
            return Err(Error::Agent(format!(
                "utc_offset_hours must be between -{MAX_OFFSET_HOURS} and {MAX_OFFSET_HOURS}"
            )));
        }

        let offset = FixedOffset::east_opt((hours * 3600.0).round() as i32)
            .ok_or_else(|| Error::Agent(format!("invalid utc offset: {hours}")))?;
        let now = Utc::now().with_timezone(&offset);
        Ok(ToolOutput::success(format!(
            "{} ({})",
            now.to_rfc3339_opts(SecondsFormat::Secs, false),
            now.format("%A")
        )))
    }
}
