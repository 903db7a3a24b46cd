//! Timestamp formatting without a date/time crate — the reference pack
//! carries no `chrono`/`time` dependency for this teacher, which itself
//! hand-rolls Unix-timestamp-to-UTC-date conversion in `run.rs`
//! (`now_rfc3339`/`format_rfc3339`); that approach is reused and extended
//! here with the weekday/month display format `main.py` uses for
//! human-readable log and error-message timestamps (`strftime('%a %b %d %X %Y')`).

const WEEKDAYS: [&str; 7] = ["Thu", "Fri", "Sat", "Sun", "Mon", "Tue", "Wed"];
const MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

/// RFC 3339 UTC timestamp, e.g. `2024-01-01T00:00:00Z`, used for structured
/// logging and the `<error-log>_cur.txt` append.
pub fn now_rfc3339() -> String {
    format_rfc3339(unix_secs())
}

/// Human-readable timestamp matching the original service's
/// `%a %b %d %X %Y` strftime format, e.g. `Mon Jan 01 00:00:00 2024`, used
/// in error artifacts (`data.json`, `report.tex`) and the `<id>.err` marker.
pub fn now_display() -> String {
    format_display(unix_secs())
}

fn unix_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

struct Broken {
    year: u64,
    month: usize,
    day: u64,
    hours: u64,
    minutes: u64,
    seconds: u64,
    /// Days since the Unix epoch (1970-01-01, a Thursday); used to derive
    /// weekday without a calendar crate.
    epoch_day: u64,
}

fn breakdown(secs: u64) -> Broken {
    let mut s = secs;
    let seconds = s % 60;
    s /= 60;
    let minutes = s % 60;
    s /= 60;
    let hours = s % 24;
    s /= 24;
    let epoch_day = s;

    let mut days = s;
    let mut year = 1970u64;
    loop {
        let days_in_year = if is_leap(year) { 366 } else { 365 };
        if days < days_in_year {
            break;
        }
        days -= days_in_year;
        year += 1;
    }

    let leap = is_leap(year);
    let month_days: [u64; 12] = [
        31,
        if leap { 29 } else { 28 },
        31,
        30,
        31,
        30,
        31,
        31,
        30,
        31,
        30,
        31,
    ];
    let mut month = 0usize;
    for (i, &d) in month_days.iter().enumerate() {
        if days < d {
            month = i;
            break;
        }
        days -= d;
    }
    let day = days + 1;

    Broken {
        year,
        month,
        day,
        hours,
        minutes,
        seconds,
        epoch_day,
    }
}

fn is_leap(year: u64) -> bool {
    (year.is_multiple_of(4) && !year.is_multiple_of(100)) || year.is_multiple_of(400)
}

fn format_rfc3339(secs: u64) -> String {
    let b = breakdown(secs);
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        b.year,
        b.month + 1,
        b.day,
        b.hours,
        b.minutes,
        b.seconds
    )
}

fn format_display(secs: u64) -> String {
    let b = breakdown(secs);
    let weekday = WEEKDAYS[(b.epoch_day % 7) as usize];
    format!(
        "{} {} {:02} {:02}:{:02}:{:02} {:04}",
        weekday,
        MONTHS[b.month],
        b.day,
        b.hours,
        b.minutes,
        b.seconds,
        b.year
    )
}
