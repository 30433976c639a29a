//! Fixed-window key derivation.
//!
//! Window instance keys are deterministic strings built from UTC wall-clock
//! components, so two requests inside the same calendar minute (or day) map
//! to the same counter row. This is fixed-window rate limiting: 12:00:59 and
//! 12:01:00 land in different minute windows even though one second apart.
//! That imprecision is part of the observable contract.

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};

use crate::store::WindowKind;

/// Window key for `kind` at instant `t`: `YYYYMMDDHHMM` for minutes,
/// `YYYYMMDD` for days.
pub fn window_key(kind: WindowKind, t: DateTime<Utc>) -> String {
    match kind {
        WindowKind::Minute => format!(
            "{:04}{:02}{:02}{:02}{:02}",
            t.year(),
            t.month(),
            t.day(),
            t.hour(),
            t.minute()
        ),
        WindowKind::Day => format!("{:04}{:02}{:02}", t.year(), t.month(), t.day()),
    }
}

/// Start of the window boundary after the one containing `t`; counters are
/// created with this as their expiry so the sweep can reclaim them.
pub fn window_expiry(kind: WindowKind, t: DateTime<Utc>) -> DateTime<Utc> {
    match kind {
        WindowKind::Minute => {
            let truncated = Utc
                .with_ymd_and_hms(t.year(), t.month(), t.day(), t.hour(), t.minute(), 0)
                .single()
                .unwrap_or(t);
            truncated + Duration::minutes(1)
        }
        WindowKind::Day => {
            let truncated = Utc
                .with_ymd_and_hms(t.year(), t.month(), t.day(), 0, 0, 0)
                .single()
                .unwrap_or(t);
            truncated + Duration::days(1)
        }
    }
}
