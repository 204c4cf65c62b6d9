use thiserror::Error;

// Maximum encoded size of a single event or service check payload, per the DogStatsD protocol.
const MAX_SERIALIZED_SIZE: usize = 8 * 1024;

/// Errors that could occur while serializing an event or service check.
#[derive(Debug, Error)]
pub enum SerializeError {
    /// The encoded event exceeds the maximum payload size and could not be truncated to fit.
    #[error("event '{title}' payload is too big (more than 8kB)")]
    EventTooBig {
        /// Title of the offending event.
        title: String,
    },

    /// The encoded service check exceeds the maximum payload size and could not be truncated to
    /// fit.
    #[error("service check '{name}' payload is too big (more than 8kB)")]
    ServiceCheckTooBig {
        /// Name of the offending service check.
        name: String,
    },

    /// The service check name contains a pipe character.
    #[error("service check name '{name}' must not contain any pipe characters")]
    PipeInServiceCheckName {
        /// The rejected name.
        name: String,
    },
}

/// The type of a metric, determining its wire-format type code.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MetricType {
    /// A monotonic count (`c`).
    Count,
    /// A timing, in milliseconds (`ms`).
    Timing,
    /// A gauge (`g`).
    Gauge,
    /// A histogram (`h`).
    Histogram,
    /// A distribution (`d`).
    Distribution,
    /// A meter (`m`).
    Meter,
    /// A set (`s`).
    Set,
}

impl MetricType {
    fn type_code(self) -> &'static str {
        match self {
            MetricType::Count => "c",
            MetricType::Timing => "ms",
            MetricType::Gauge => "g",
            MetricType::Histogram => "h",
            MetricType::Distribution => "d",
            MetricType::Meter => "m",
            MetricType::Set => "s",
        }
    }
}

/// A metric value.
///
/// Numeric values are rendered with a fixed, locale-independent decimal representation, which
/// keeps the wire format deterministic across hosts. Textual values exist for set metrics, whose
/// members need not be numeric.
#[derive(Clone, Debug)]
pub enum MetricValue {
    /// A signed integer value.
    Signed(i64),
    /// An unsigned integer value.
    Unsigned(u64),
    /// A floating point value.
    Float(f64),
    /// A textual value (set members).
    Text(String),
}

impl From<i64> for MetricValue {
    fn from(value: i64) -> Self {
        MetricValue::Signed(value)
    }
}

impl From<i32> for MetricValue {
    fn from(value: i32) -> Self {
        MetricValue::Signed(i64::from(value))
    }
}

impl From<u64> for MetricValue {
    fn from(value: u64) -> Self {
        MetricValue::Unsigned(value)
    }
}

impl From<u32> for MetricValue {
    fn from(value: u32) -> Self {
        MetricValue::Unsigned(u64::from(value))
    }
}

impl From<f64> for MetricValue {
    fn from(value: f64) -> Self {
        MetricValue::Float(value)
    }
}

impl From<&str> for MetricValue {
    fn from(value: &str) -> Self {
        MetricValue::Text(value.to_string())
    }
}

impl From<String> for MetricValue {
    fn from(value: String) -> Self {
        MetricValue::Text(value)
    }
}

/// An event to be sent to the event stream.
#[derive(Clone, Debug, Default)]
pub struct Event<'a> {
    /// Event title.
    pub title: &'a str,
    /// Event body text.
    pub text: &'a str,
    /// Alert type (`error`, `warning`, `info`, or `success`).
    pub alert_type: Option<&'a str>,
    /// Key to aggregate related events under.
    pub aggregation_key: Option<&'a str>,
    /// Source type name.
    pub source_type: Option<&'a str>,
    /// Unix timestamp of when the event happened.
    pub date_happened: Option<i64>,
    /// Event priority (`normal` or `low`).
    pub priority: Option<&'a str>,
    /// Hostname to attribute the event to.
    pub hostname: Option<&'a str>,
}

impl<'a> Event<'a> {
    /// Creates an event with the given title and text, and no optional fields.
    pub fn new(title: &'a str, text: &'a str) -> Self {
        Event { title, text, ..Event::default() }
    }
}

/// The reported status of a service check.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ServiceCheckStatus {
    /// The service is healthy.
    Ok,
    /// The service is degraded.
    Warning,
    /// The service is unavailable.
    Critical,
    /// The service status could not be determined.
    Unknown,
}

impl ServiceCheckStatus {
    fn as_code(self) -> u64 {
        match self {
            ServiceCheckStatus::Ok => 0,
            ServiceCheckStatus::Warning => 1,
            ServiceCheckStatus::Critical => 2,
            ServiceCheckStatus::Unknown => 3,
        }
    }
}

/// A service check to be reported.
#[derive(Clone, Debug)]
pub struct ServiceCheck<'a> {
    /// Service check name. Must not contain pipe characters.
    pub name: &'a str,
    /// Reported status.
    pub status: ServiceCheckStatus,
    /// Unix timestamp of when the check was performed.
    pub timestamp: Option<i64>,
    /// Hostname to attribute the check to.
    pub hostname: Option<&'a str>,
    /// Free-form message describing the current state.
    pub message: Option<&'a str>,
}

impl<'a> ServiceCheck<'a> {
    /// Creates a service check with the given name and status, and no optional fields.
    pub fn new(name: &'a str, status: ServiceCheckStatus) -> Self {
        ServiceCheck { name, status, timestamp: None, hostname: None, message: None }
    }
}

/// Renders a metric line: `<prefix><name>:<value>|<code>[|@<rate>][|#<tags>]`.
///
/// The sample rate suffix is omitted when the rate is exactly 1.0, and the tag suffix is omitted
/// when both tag lists are empty.
pub(crate) fn metric_line(
    prefix: &str,
    name: &str,
    metric_type: MetricType,
    value: &MetricValue,
    sample_rate: f64,
    constant_tags: &[String],
    tags: &[String],
) -> String {
    let mut line = String::with_capacity(prefix.len() + name.len() + 32);
    line.push_str(prefix);
    line.push_str(name);
    line.push(':');
    write_value(&mut line, value);
    line.push('|');
    line.push_str(metric_type.type_code());

    if sample_rate != 1.0 {
        let mut float_writer = ryu::Buffer::new();
        line.push_str("|@");
        line.push_str(float_writer.format(sample_rate));
    }

    write_tags(&mut line, constant_tags, tags);
    line
}

/// Renders an event line, truncating the title or text when permitted.
///
/// The line is `_e{<titleLen>,<textLen>}:<title>|<text>`, followed by the optional suffixes in
/// fixed order (`|d:`, `|h:`, `|k:`, `|p:`, `|s:`, `|t:`), then tags. Length fields count the
/// escaped text, in bytes, matching what the server slices out of the transmitted payload.
///
/// If the encoded line exceeds the maximum payload size and truncation is permitted, the longer of
/// title/text is shortened by exactly the overage and the line is rendered once more; this is an
/// explicit two-step rather than open-ended recursion, so it always terminates.
pub(crate) fn event_line(
    event: &Event<'_>,
    constant_tags: &[String],
    tags: &[String],
    truncate_if_too_long: bool,
) -> Result<String, SerializeError> {
    let mut title = escape_content(event.title);
    let mut text = escape_content(event.text);

    let line = render_event(&title, &text, event, constant_tags, tags);
    if line.len() <= MAX_SERIALIZED_SIZE {
        return Ok(line);
    }

    if !truncate_if_too_long {
        return Err(SerializeError::EventTooBig { title: event.title.to_string() });
    }

    let overage = line.len() - MAX_SERIALIZED_SIZE;
    if title.len() > text.len() {
        shorten_by(&mut title, overage);
    } else {
        shorten_by(&mut text, overage);
    }

    let line = render_event(&title, &text, event, constant_tags, tags);
    if line.len() <= MAX_SERIALIZED_SIZE {
        Ok(line)
    } else {
        Err(SerializeError::EventTooBig { title: event.title.to_string() })
    }
}

/// Renders a service check line, truncating the message when permitted.
///
/// The line is `_sc|<name>|<status>`, followed by optional `|d:` and `|h:` suffixes, tags, and
/// `|m:<message>` always last. Only the message is ever truncated; a name too long to fit is an
/// error.
pub(crate) fn service_check_line(
    check: &ServiceCheck<'_>,
    constant_tags: &[String],
    tags: &[String],
    truncate_if_too_long: bool,
) -> Result<String, SerializeError> {
    let name = escape_content(check.name);
    if name.contains('|') {
        return Err(SerializeError::PipeInServiceCheckName { name: check.name.to_string() });
    }

    let mut message = match check.message {
        Some(message) if !message.is_empty() => Some(escape_message(message)),
        _ => None,
    };

    let line = render_service_check(&name, message.as_deref(), check, constant_tags, tags);
    if line.len() <= MAX_SERIALIZED_SIZE {
        return Ok(line);
    }

    if !truncate_if_too_long {
        return Err(SerializeError::ServiceCheckTooBig { name: check.name.to_string() });
    }

    let overage = line.len() - MAX_SERIALIZED_SIZE;
    match message.as_mut() {
        Some(message) if overage <= message.len() => shorten_by(message, overage),
        // The name is never truncated, so with no message (or one shorter than the overage)
        // there's nothing left to cut.
        _ => return Err(SerializeError::ServiceCheckTooBig { name: check.name.to_string() }),
    }

    let line = render_service_check(&name, message.as_deref(), check, constant_tags, tags);
    if line.len() <= MAX_SERIALIZED_SIZE {
        Ok(line)
    } else {
        Err(SerializeError::ServiceCheckTooBig { name: check.name.to_string() })
    }
}

fn render_event(
    title: &str,
    text: &str,
    event: &Event<'_>,
    constant_tags: &[String],
    tags: &[String],
) -> String {
    let mut int_writer = itoa::Buffer::new();
    let mut line = String::with_capacity(title.len() + text.len() + 64);

    line.push_str("_e{");
    line.push_str(int_writer.format(title.len()));
    line.push(',');
    line.push_str(int_writer.format(text.len()));
    line.push_str("}:");
    line.push_str(title);
    line.push('|');
    line.push_str(text);

    if let Some(date_happened) = event.date_happened {
        line.push_str("|d:");
        line.push_str(int_writer.format(date_happened));
    }

    if let Some(hostname) = event.hostname {
        line.push_str("|h:");
        line.push_str(hostname);
    }

    if let Some(aggregation_key) = event.aggregation_key {
        line.push_str("|k:");
        line.push_str(aggregation_key);
    }

    if let Some(priority) = event.priority {
        line.push_str("|p:");
        line.push_str(priority);
    }

    if let Some(source_type) = event.source_type {
        line.push_str("|s:");
        line.push_str(source_type);
    }

    if let Some(alert_type) = event.alert_type {
        line.push_str("|t:");
        line.push_str(alert_type);
    }

    write_tags(&mut line, constant_tags, tags);
    line
}

fn render_service_check(
    name: &str,
    message: Option<&str>,
    check: &ServiceCheck<'_>,
    constant_tags: &[String],
    tags: &[String],
) -> String {
    let mut int_writer = itoa::Buffer::new();
    let mut line = String::with_capacity(name.len() + 64);

    line.push_str("_sc|");
    line.push_str(name);
    line.push('|');
    line.push_str(int_writer.format(check.status.as_code()));

    if let Some(timestamp) = check.timestamp {
        line.push_str("|d:");
        line.push_str(int_writer.format(timestamp));
    }

    if let Some(hostname) = check.hostname {
        line.push_str("|h:");
        line.push_str(hostname);
    }

    write_tags(&mut line, constant_tags, tags);

    // The message marker doubles as the terminator, so it must come after everything else.
    if let Some(message) = message {
        line.push_str("|m:");
        line.push_str(message);
    }

    line
}

fn write_value(line: &mut String, value: &MetricValue) {
    match value {
        MetricValue::Signed(v) => {
            let mut int_writer = itoa::Buffer::new();
            line.push_str(int_writer.format(*v));
        }
        MetricValue::Unsigned(v) => {
            let mut int_writer = itoa::Buffer::new();
            line.push_str(int_writer.format(*v));
        }
        MetricValue::Float(v) => {
            let mut float_writer = ryu::Buffer::new();
            line.push_str(float_writer.format(*v));
        }
        MetricValue::Text(v) => line.push_str(v),
    }
}

fn write_tags(line: &mut String, constant_tags: &[String], tags: &[String]) {
    if constant_tags.is_empty() && tags.is_empty() {
        return;
    }

    let mut wrote_tag = false;
    for tag in constant_tags.iter().chain(tags.iter()) {
        if wrote_tag {
            line.push(',');
        } else {
            line.push_str("|#");
            wrote_tag = true;
        }

        line.push_str(tag);
    }
}

fn escape_content(content: &str) -> String {
    content.replace('\r', "").replace('\n', "\\n")
}

fn escape_message(message: &str) -> String {
    // `m:` inside the message would be ambiguous with the trailing field marker.
    escape_content(message).replace("m:", "m\\:")
}

fn shorten_by(s: &mut String, overage: usize) {
    let mut cut = s.len().saturating_sub(overage);
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    s.truncate(cut);
}
