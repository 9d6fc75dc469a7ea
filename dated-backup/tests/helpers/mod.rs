#![allow(dead_code)]

pub mod doubles;
pub mod fixtures;

use chrono::{NaiveDate, NaiveDateTime};

/// Wall-clock time on a given day
pub fn at(y: i32, m: u32, d: u32, h: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(y, m, d)
        .unwrap()
        .and_hms_opt(h, 0, 0)
        .unwrap()
}
