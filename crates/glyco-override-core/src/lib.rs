use std::fmt::{Debug, Formatter};
use std::sync::Weak;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{Duration, OffsetDateTime, PrimitiveDateTime, UtcOffset};

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum OverrideError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("schedule error: {0}")]
    Schedule(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// How far back recorded override events are kept. Matches the longest
/// interval a resolving consumer can look back over (the slowest
/// carbohydrate-absorption horizon).
pub const EVENT_RETENTION_PERIOD: Duration = Duration::hours(8);

fn far_future() -> OffsetDateTime {
    PrimitiveDateTime::MAX.assume_utc()
}

// One representable unit below `instant` at this crate's timestamp
// resolution. Truncation cutoffs use this so a truncated interval's upper
// bound stays strictly below the successor's start.
fn just_before(instant: OffsetDateTime) -> OffsetDateTime {
    instant - Duration::NANOSECOND
}

/// Half-open interval `[start, end)` over UTC instants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateInterval {
    pub start: OffsetDateTime,
    pub end: OffsetDateTime,
}

impl DateInterval {
    #[must_use]
    pub fn intersects(&self, other: &DateInterval) -> bool {
        self.start < other.end && other.start < self.end
    }

    #[must_use]
    pub fn contains(&self, instant: OffsetDateTime) -> bool {
        self.start <= instant && instant < self.end
    }

    #[must_use]
    pub fn duration(&self) -> Duration {
        self.end - self.start
    }
}

/// Glucose target range in mg/dL.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TargetRange {
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OverrideSettings {
    pub target_range: Option<TargetRange>,
    pub insulin_needs_scale_factor: Option<f64>,
}

impl OverrideSettings {
    #[must_use]
    pub fn effective_scale_factor(&self) -> f64 {
        self.insulin_needs_scale_factor.unwrap_or(1.0)
    }

    #[must_use]
    pub fn basal_rate_multiplier(&self) -> f64 {
        self.effective_scale_factor()
    }

    // Needing more insulin means each unit drops glucose less and covers
    // fewer carbs, so both schedules scale by the inverse.
    #[must_use]
    pub fn sensitivity_multiplier(&self) -> f64 {
        1.0 / self.effective_scale_factor()
    }

    #[must_use]
    pub fn carb_ratio_multiplier(&self) -> f64 {
        1.0 / self.effective_scale_factor()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideDuration {
    Finite(#[serde(with = "duration_seconds")] Duration),
    Indefinite,
}

impl OverrideDuration {
    #[must_use]
    pub fn is_indefinite(&self) -> bool {
        matches!(self, Self::Indefinite)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideContext {
    PreMeal,
    Workout,
    Preset { name: String },
    Custom,
}

/// A time-bounded adjustment to insulin delivery parameters. Two overrides
/// are the same override exactly when every field matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleOverride {
    pub context: OverrideContext,
    pub settings: OverrideSettings,
    #[serde(with = "time::serde::rfc3339")]
    pub start_date: OffsetDateTime,
    pub duration: OverrideDuration,
}

impl ScheduleOverride {
    #[must_use]
    pub fn end_date(&self) -> OffsetDateTime {
        match self.duration {
            OverrideDuration::Finite(duration) => self.start_date + duration,
            OverrideDuration::Indefinite => far_future(),
        }
    }

    #[must_use]
    pub fn active_interval(&self) -> DateInterval {
        DateInterval {
            start: self.start_date,
            end: self.end_date(),
        }
    }

    /// Active interval with an open end clamped to the reference instant:
    /// an indefinite override is only known to apply up to "now".
    #[must_use]
    pub fn active_interval_relative_to(&self, reference_date: OffsetDateTime) -> DateInterval {
        match self.duration {
            OverrideDuration::Finite(_) => self.active_interval(),
            OverrideDuration::Indefinite => DateInterval {
                start: self.start_date,
                end: reference_date.max(self.start_date),
            },
        }
    }

    #[must_use]
    pub fn has_finished(&self, reference_date: OffsetDateTime) -> bool {
        self.end_date() <= reference_date
    }

    #[must_use]
    pub fn is_active(&self, reference_date: OffsetDateTime) -> bool {
        self.active_interval().contains(reference_date)
    }

    /// A copy of this override whose duration is pinned so it ends at
    /// `end_date`.
    #[must_use]
    pub fn ending_at(&self, end_date: OffsetDateTime) -> Self {
        Self {
            duration: OverrideDuration::Finite(end_date - self.start_date),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScheduleItem {
    #[serde(with = "duration_seconds")]
    pub start_offset: Duration,
    pub value: f64,
}

/// A repeating daily schedule: breakpoint offsets from midnight UTC, each
/// holding its value until the next breakpoint. The first item sits at
/// offset zero so every instant of the day is covered.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailySchedule {
    items: Vec<ScheduleItem>,
}

pub type BasalRateSchedule = DailySchedule;
pub type InsulinSensitivitySchedule = DailySchedule;
pub type CarbRatioSchedule = DailySchedule;

#[derive(Deserialize)]
struct RawDailySchedule {
    items: Vec<ScheduleItem>,
}

impl DailySchedule {
    pub const REPEAT_INTERVAL: Duration = Duration::hours(24);

    /// Builds a schedule from breakpoint items.
    ///
    /// # Errors
    /// Returns [`OverrideError::Schedule`] when items are empty, do not start
    /// at offset zero, are not strictly ascending, run past the repeat
    /// interval, or hold non-finite values.
    pub fn new(items: Vec<ScheduleItem>) -> Result<Self, OverrideError> {
        let Some(first) = items.first() else {
            return Err(OverrideError::Schedule(
                "schedule MUST contain at least one item".to_string(),
            ));
        };

        if first.start_offset != Duration::ZERO {
            return Err(OverrideError::Schedule(
                "schedule MUST start at offset zero".to_string(),
            ));
        }

        for pair in items.windows(2) {
            if pair[1].start_offset <= pair[0].start_offset {
                return Err(OverrideError::Schedule(
                    "schedule offsets MUST be strictly ascending".to_string(),
                ));
            }
        }

        for item in &items {
            if item.start_offset >= Self::REPEAT_INTERVAL {
                return Err(OverrideError::Schedule(
                    "schedule offsets MUST fall within one day".to_string(),
                ));
            }
            if !item.value.is_finite() {
                return Err(OverrideError::Schedule(
                    "schedule values MUST be finite".to_string(),
                ));
            }
        }

        Ok(Self { items })
    }

    /// Decodes and validates a schedule from JSON.
    ///
    /// # Errors
    /// Returns [`OverrideError::Schedule`] when JSON decoding fails or the
    /// decoded items violate schedule constraints.
    pub fn from_json(value: &Value) -> Result<Self, OverrideError> {
        let raw: RawDailySchedule = serde_json::from_value(value.clone()).map_err(|err| {
            OverrideError::Schedule(format!("invalid schedule JSON payload: {err}"))
        })?;
        Self::new(raw.items)
    }

    #[must_use]
    pub fn items(&self) -> &[ScheduleItem] {
        &self.items
    }

    /// Value in effect at an offset from midnight.
    #[must_use]
    pub fn value_at(&self, offset: Duration) -> f64 {
        let mut value = 0.0;
        for item in &self.items {
            if item.start_offset > offset {
                break;
            }
            value = item.value;
        }
        value
    }

    #[must_use]
    pub fn applying_basal_rate_multiplier(
        &self,
        override_value: &ScheduleOverride,
        reference_date: OffsetDateTime,
    ) -> Self {
        self.applying_multiplier(
            override_value.active_interval_relative_to(reference_date),
            override_value.settings.basal_rate_multiplier(),
        )
    }

    #[must_use]
    pub fn applying_sensitivity_multiplier(
        &self,
        override_value: &ScheduleOverride,
        reference_date: OffsetDateTime,
    ) -> Self {
        self.applying_multiplier(
            override_value.active_interval_relative_to(reference_date),
            override_value.settings.sensitivity_multiplier(),
        )
    }

    #[must_use]
    pub fn applying_carb_ratio_multiplier(
        &self,
        override_value: &ScheduleOverride,
        reference_date: OffsetDateTime,
    ) -> Self {
        self.applying_multiplier(
            override_value.active_interval_relative_to(reference_date),
            override_value.settings.carb_ratio_multiplier(),
        )
    }

    fn schedule_offset(instant: OffsetDateTime) -> Duration {
        let utc = instant.to_offset(UtcOffset::UTC);
        let day_start = utc.date().midnight().assume_utc();
        utc - day_start
    }

    fn applying_multiplier(&self, interval: DateInterval, multiplier: f64) -> Self {
        if interval.end <= interval.start {
            return self.clone();
        }

        let window_start = Self::schedule_offset(interval.start);
        let span = interval.duration().min(Self::REPEAT_INTERVAL);
        let window_end = window_start + span;

        if window_end <= Self::REPEAT_INTERVAL {
            self.splicing_multiplier(window_start, window_end, multiplier)
        } else {
            // The covered span crosses midnight; splice both day fragments.
            self.splicing_multiplier(window_start, Self::REPEAT_INTERVAL, multiplier)
                .splicing_multiplier(
                    Duration::ZERO,
                    window_end - Self::REPEAT_INTERVAL,
                    multiplier,
                )
        }
    }

    // Multiplies values over `[window_start, window_end)` and restores the
    // baseline value at the window end, keeping untouched breakpoints as-is.
    // Expects 0 <= window_start < window_end <= REPEAT_INTERVAL.
    fn splicing_multiplier(
        &self,
        window_start: Duration,
        window_end: Duration,
        multiplier: f64,
    ) -> Self {
        let mut items: Vec<ScheduleItem> = Vec::with_capacity(self.items.len() + 2);

        for item in self
            .items
            .iter()
            .filter(|item| item.start_offset < window_start)
        {
            items.push(*item);
        }

        items.push(ScheduleItem {
            start_offset: window_start,
            value: self.value_at(window_start) * multiplier,
        });

        for item in &self.items {
            if item.start_offset > window_start && item.start_offset < window_end {
                items.push(ScheduleItem {
                    start_offset: item.start_offset,
                    value: item.value * multiplier,
                });
            }
        }

        if window_end < Self::REPEAT_INTERVAL {
            let has_item_at_end = self
                .items
                .iter()
                .any(|item| item.start_offset == window_end);
            if !has_item_at_end {
                items.push(ScheduleItem {
                    start_offset: window_end,
                    value: self.value_at(window_end),
                });
            }

            for item in self
                .items
                .iter()
                .filter(|item| item.start_offset >= window_end)
            {
                items.push(*item);
            }
        }

        Self { items }
    }
}

/// Persisted shape of a single history entry: the override itself plus an
/// early-end timestamp present only when the engine truncated the event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverrideEventRecord {
    #[serde(rename = "override")]
    pub override_value: ScheduleOverride,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub end_date: Option<OffsetDateTime>,
}

// "Not yet truncated" and "truncated at instant T" stay distinct variants so
// neither can be mistaken for a truncation at some default instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventEnd {
    Natural,
    Early(OffsetDateTime),
}

#[derive(Debug, Clone, PartialEq)]
struct OverrideEvent {
    override_value: ScheduleOverride,
    end: EventEnd,
}

impl OverrideEvent {
    fn new(override_value: ScheduleOverride) -> Self {
        Self {
            override_value,
            end: EventEnd::Natural,
        }
    }

    fn actual_end_date(&self) -> OffsetDateTime {
        match self.end {
            EventEnd::Natural => self.override_value.end_date(),
            EventEnd::Early(end_date) => end_date,
        }
    }

    fn record(&self) -> OverrideEventRecord {
        OverrideEventRecord {
            override_value: self.override_value.clone(),
            end_date: match self.end {
                EventEnd::Natural => None,
                EventEnd::Early(end_date) => Some(end_date),
            },
        }
    }

    fn from_record(record: OverrideEventRecord) -> Self {
        Self {
            override_value: record.override_value,
            end: record.end_date.map_or(EventEnd::Natural, EventEnd::Early),
        }
    }
}

/// Observer for history mutations. Invoked synchronously after a mutation is
/// fully applied, with no change payload; observers re-read the history.
pub trait OverrideHistoryDelegate {
    fn override_history_did_update(&self, history: &OverrideHistory);
}

/// Chronological record of temporary schedule overrides, resolved into a
/// non-overlapping timeline and folded onto baseline daily schedules.
#[derive(Default)]
pub struct OverrideHistory {
    recent_events: Vec<OverrideEvent>,
    delegate: Option<Weak<dyn OverrideHistoryDelegate>>,
}

impl Debug for OverrideHistory {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "OverrideHistory(recent_events: {:?})", self.recent_events)
    }
}

impl OverrideHistory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the single observer slot. The reference is non-owning; the
    /// history never extends the delegate's lifetime.
    pub fn set_delegate(&mut self, delegate: Weak<dyn OverrideHistoryDelegate>) {
        self.delegate = Some(delegate);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.recent_events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.recent_events.is_empty()
    }

    /// Records that an override was enabled, edited, or disabled (`None`) as
    /// of `enable_date`, keeping recorded intervals disjoint.
    ///
    /// Re-recording the override already at the tail is a no-op. A previous
    /// event that is still untouched and unfinished is either removed (it
    /// never started, or this is a same-start edit) or truncated to end just
    /// before the incoming override begins.
    pub fn record_override(
        &mut self,
        override_value: Option<ScheduleOverride>,
        enable_date: OffsetDateTime,
    ) {
        if override_value.as_ref() == self.recent_events.last().map(|event| &event.override_value) {
            return;
        }

        let mut mutated = false;

        if let Some(last) = self.recent_events.last_mut() {
            if matches!(last.end, EventEnd::Natural)
                && !last.override_value.has_finished(enable_date)
            {
                let not_yet_started = last.override_value.start_date > enable_date;
                let edited = override_value
                    .as_ref()
                    .is_some_and(|incoming| incoming.start_date == last.override_value.start_date);

                if not_yet_started || edited {
                    self.recent_events.pop();
                } else {
                    // A truncation boundary must sit strictly below the
                    // incoming start even when both coincide with the enable
                    // instant.
                    let cutoff = match &override_value {
                        Some(incoming) => just_before(incoming.start_date).min(enable_date),
                        None => enable_date,
                    };
                    last.end = EventEnd::Early(cutoff);
                }
                mutated = true;
            }
        }

        if let Some(incoming) = override_value {
            self.recent_events.push(OverrideEvent::new(incoming));
            mutated = true;
        }

        if mutated {
            self.notify_delegate();
        }
    }

    /// Resolves the history onto a baseline basal-rate schedule as of
    /// `reference_date`. Prunes stale events first.
    #[must_use]
    pub fn resolving_basal_schedule(
        &mut self,
        base: &BasalRateSchedule,
        reference_date: OffsetDateTime,
    ) -> BasalRateSchedule {
        self.filter_recent_events(reference_date);
        self.overrides_reflecting_enabled_duration()
            .iter()
            .fold(base.clone(), |schedule, override_value| {
                schedule.applying_basal_rate_multiplier(override_value, reference_date)
            })
    }

    /// Resolves the history onto a baseline insulin-sensitivity schedule as
    /// of `reference_date`. Prunes stale events first.
    #[must_use]
    pub fn resolving_sensitivity_schedule(
        &mut self,
        base: &InsulinSensitivitySchedule,
        reference_date: OffsetDateTime,
    ) -> InsulinSensitivitySchedule {
        self.filter_recent_events(reference_date);
        self.overrides_reflecting_enabled_duration()
            .iter()
            .fold(base.clone(), |schedule, override_value| {
                schedule.applying_sensitivity_multiplier(override_value, reference_date)
            })
    }

    /// Resolves the history onto a baseline carb-ratio schedule as of
    /// `reference_date`. Prunes stale events first.
    #[must_use]
    pub fn resolving_carb_ratio_schedule(
        &mut self,
        base: &CarbRatioSchedule,
        reference_date: OffsetDateTime,
    ) -> CarbRatioSchedule {
        self.filter_recent_events(reference_date);
        self.overrides_reflecting_enabled_duration()
            .iter()
            .fold(base.clone(), |schedule, override_value| {
                schedule.applying_carb_ratio_multiplier(override_value, reference_date)
            })
    }

    /// Clears all events unconditionally.
    pub fn wipe(&mut self) {
        self.recent_events.clear();
        self.notify_delegate();
    }

    /// The history's persistable form: one record per event, oldest first.
    #[must_use]
    pub fn raw_value(&self) -> Vec<OverrideEventRecord> {
        self.recent_events.iter().map(OverrideEvent::record).collect()
    }

    #[must_use]
    pub fn from_raw_value(records: Vec<OverrideEventRecord>) -> Self {
        Self {
            recent_events: records.into_iter().map(OverrideEvent::from_record).collect(),
            delegate: None,
        }
    }

    /// Encodes the raw records as a JSON array.
    ///
    /// # Errors
    /// Returns [`OverrideError::Serialization`] when JSON encoding fails.
    pub fn to_json(&self) -> Result<Value, OverrideError> {
        serde_json::to_value(self.raw_value()).map_err(|err| {
            OverrideError::Serialization(format!("failed to encode override history: {err}"))
        })
    }

    /// Decodes a history from a JSON array of records. Records that fail to
    /// decode are dropped rather than failing the whole history; anything
    /// other than an array yields an empty history.
    #[must_use]
    pub fn from_json(value: &Value) -> Self {
        let records = value
            .as_array()
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| {
                        serde_json::from_value::<OverrideEventRecord>(entry.clone()).ok()
                    })
                    .collect()
            })
            .unwrap_or_default();
        Self::from_raw_value(records)
    }

    // Drops events whose effective end predates the retention horizon.
    // Mutates and notifies only when something actually drops.
    fn filter_recent_events(&mut self, reference_date: OffsetDateTime) {
        let oldest_end_to_keep = reference_date - EVENT_RETENTION_PERIOD;

        let retained: Vec<OverrideEvent> = self
            .recent_events
            .iter()
            .filter(|event| event.actual_end_date() >= oldest_end_to_keep)
            .cloned()
            .collect();

        if retained != self.recent_events {
            self.recent_events = retained;
            self.notify_delegate();
        }
    }

    // Projects events into overrides whose end dates reflect the duration
    // they were actually enabled for.
    fn overrides_reflecting_enabled_duration(&self) -> Vec<ScheduleOverride> {
        let overrides: Vec<ScheduleOverride> = self
            .recent_events
            .iter()
            .map(|event| match event.end {
                EventEnd::Natural => event.override_value.clone(),
                EventEnd::Early(end_date) => event.override_value.ending_at(end_date),
            })
            .collect();

        for pair in overrides.windows(2) {
            assert!(
                !pair[0].active_interval().intersects(&pair[1].active_interval()),
                "no overrides should overlap"
            );
        }

        overrides
    }

    fn notify_delegate(&self) {
        if let Some(delegate) = self.delegate.as_ref().and_then(Weak::upgrade) {
            delegate.override_history_did_update(self);
        }
    }
}

mod duration_seconds {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Duration,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_seconds_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let seconds = f64::deserialize(deserializer)?;
        if !seconds.is_finite() || seconds.abs() > 9.0e18 {
            return Err(serde::de::Error::custom(
                "duration seconds must be a finite number of representable seconds",
            ));
        }
        Ok(Duration::seconds_f64(seconds))
    }
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`OverrideError::Validation`] when parsing fails or the input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, OverrideError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| OverrideError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(OverrideError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`OverrideError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, OverrideError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            OverrideError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
