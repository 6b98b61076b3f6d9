// FATX packed date/time handling.
// FATX packs a calendar timestamp into 32 bits, from the low end:
// seconds/2 (5 bits), minute (6), hour (5), day (5), month (4),
// year-1980 (7). A raw value of 0 means "unknown time".

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Timelike, Utc};

/// Earliest representable FATX timestamp, used for unknown times.
pub fn epoch_floor() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(1980, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or_default()
}

/// Decode a packed FATX timestamp. Invalid field combinations and the
/// zero marker both collapse to the epoch floor.
pub fn decode_timestamp(raw: u32) -> DateTime<Utc> {
    if raw == 0 {
        return epoch_floor();
    }

    let second = ((raw & 0x1F) * 2) as u32;
    let minute = (raw >> 5) & 0x3F;
    let hour = (raw >> 11) & 0x1F;
    let day = (raw >> 16) & 0x1F;
    let month = (raw >> 21) & 0x0F;
    let year = ((raw >> 25) & 0x7F) as i32 + 1980;

    match NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|date| date.and_hms_opt(hour, minute, second))
    {
        Some(naive) => naive.and_utc(),
        None => epoch_floor(),
    }
}

/// Encode a timestamp into the packed FATX form. The year is clamped to
/// the representable 1980-2107 window.
pub fn encode_timestamp(when: DateTime<Utc>) -> u32 {
    let year = match when.year() {
        y if y < 1980 => 0,
        y if y > 2107 => 127,
        y => (y - 1980) as u32,
    };

    (year << 25)
        | (when.month() << 21)
        | (when.day() << 16)
        | (when.hour() << 11)
        | (when.minute() << 5)
        | (when.second() / 2)
}

/// Current time in packed FATX form.
pub fn now() -> u32 {
    encode_timestamp(Utc::now())
}
