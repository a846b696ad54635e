//! Time plugin: current UTC time, today's date, day of week.

use chrono::{DateTime, Utc};
use rustedkernel_core::error::BoxError;
use rustedkernel_core::function::KernelFunction;
use std::sync::Arc;

use crate::source::NativePlugin;

/// Clock-reading functions. A fixed instant makes output reproducible.
#[derive(Debug, Clone, Default)]
pub struct TimePlugin {
    fixed: Option<DateTime<Utc>>,
}

impl TimePlugin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Always report `instant` instead of the wall clock.
    pub fn fixed(instant: DateTime<Utc>) -> Self {
        Self {
            fixed: Some(instant),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.fixed.unwrap_or_else(Utc::now)
    }
}

impl NativePlugin for TimePlugin {
    fn description(&self) -> &str {
        "Current date and time in UTC"
    }

    fn functions(self: Arc<Self>) -> Vec<KernelFunction> {
        let utc = Arc::clone(&self);
        let today = Arc::clone(&self);
        let weekday = self;
        vec![
            KernelFunction::from_fn(
                "GetCurrentUtcTime",
                "Current UTC date and time in RFC 3339 format",
                vec![],
                move |_args| {
                    let now = utc.now();
                    async move { Ok::<_, BoxError>(serde_json::Value::from(now.to_rfc3339())) }
                },
            ),
            KernelFunction::from_fn("Today", "Current UTC date as YYYY-MM-DD", vec![], move |_args| {
                let now = today.now();
                async move { Ok::<_, BoxError>(serde_json::Value::from(now.format("%Y-%m-%d").to_string())) }
            }),
            KernelFunction::from_fn(
                "DayOfWeek",
                "Current day of the week in UTC, e.g. Monday",
                vec![],
                move |_args| {
                    let now = weekday.now();
                    async move { Ok::<_, BoxError>(serde_json::Value::from(now.format("%A").to_string())) }
                },
            ),
        ]
    }
}
