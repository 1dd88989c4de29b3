//! Join two irregular time series onto one bounded grid for charting.
//!
//! Grid policy:
//! - Buckets start at the earliest timestamp of either series (truncated to
//!   the second) and are `max(60, ceil(span / (max_points + 1)))` seconds
//!   wide, so a chart never has more than `max_points + 2` points.
//! - Each bucket takes the first value that falls inside it.
//! - Empty buckets are `None` for [`Fill::Gaps`] series and carry the last
//!   known value for [`Fill::Forward`] series. A forward-filled bucket is the
//!   most recent value at or before the bucket, never an interpolation.
//! - If both series together span no more than one second, nothing is
//!   resampled and the raw points are returned.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

pub const MIN_BUCKET_SECS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fill {
    /// Leave empty buckets empty.
    Gaps,
    /// Repeat the previous value; for piecewise-constant series like control state.
    Forward,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Point<T> {
    pub time: DateTime<Utc>,
    pub value: Option<T>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Aligned<A, B> {
    /// Bucket width; `None` when the inputs were returned unchanged.
    pub bucket_secs: Option<i64>,
    pub left: Vec<Point<A>>,
    pub right: Vec<Point<B>>,
}

/// Width in seconds for a span of `span_secs` split into at most `max_points + 1` buckets.
pub fn bucket_width(span_secs: i64, max_points: usize) -> i64 {
    let divisor = i64::try_from(max_points).unwrap_or(i64::MAX - 1) + 1;
    let width = span_secs.max(0).div_euclid(divisor) + i64::from(span_secs.rem_euclid(divisor) != 0);
    width.max(MIN_BUCKET_SECS)
}

fn bounds<A, B>(left: &[(DateTime<Utc>, A)], right: &[(DateTime<Utc>, B)]) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let times = left.iter().map(|(t, _)| *t).chain(right.iter().map(|(t, _)| *t));
    times.fold(None, |acc, t| match acc {
        None => Some((t, t)),
        Some((lo, hi)) => Some((lo.min(t), hi.max(t))),
    })
}

fn raw<T: Clone>(series: &[(DateTime<Utc>, T)]) -> Vec<Point<T>> {
    series
        .iter()
        .map(|(time, value)| Point {
            time: *time,
            value: Some(value.clone()),
        })
        .collect()
}

fn resample<T: Clone>(
    series: &[(DateTime<Utc>, T)],
    origin: DateTime<Utc>,
    width: i64,
    buckets: usize,
    fill: Fill,
) -> Vec<Point<T>> {
    if series.is_empty() {
        return Vec::new();
    }
    let mut slots: Vec<Option<T>> = vec![None; buckets];
    let mut ordered: Vec<&(DateTime<Utc>, T)> = series.iter().collect();
    ordered.sort_by_key(|(t, _)| *t);
    for (time, value) in ordered {
        let offset = (*time - origin).num_seconds();
        let Ok(index) = usize::try_from(offset.div_euclid(width)) else {
            continue;
        };
        if let Some(slot) = slots.get_mut(index)
            && slot.is_none()
        {
            *slot = Some(value.clone());
        }
    }
    if fill == Fill::Forward {
        let mut last: Option<T> = None;
        for slot in slots.iter_mut() {
            if slot.is_some() {
                last.clone_from(slot);
            } else {
                slot.clone_from(&last);
            }
        }
    }
    slots
        .into_iter()
        .enumerate()
        .map(|(i, value)| Point {
            time: origin + Duration::seconds(width * i as i64),
            value,
        })
        .collect()
}

/// Resample `left` and `right` onto a shared grid of at most `max_points + 2` buckets.
pub fn align<A: Clone, B: Clone>(
    left: &[(DateTime<Utc>, A)],
    left_fill: Fill,
    right: &[(DateTime<Utc>, B)],
    right_fill: Fill,
    max_points: usize,
) -> Aligned<A, B> {
    let unchanged = || Aligned {
        bucket_secs: None,
        left: raw(left),
        right: raw(right),
    };
    let Some((first, last)) = bounds(left, right) else {
        return unchanged();
    };
    let span = (last - first).num_seconds();
    if span <= 1 {
        return unchanged();
    }
    let width = bucket_width(span, max_points);
    let origin = DateTime::<Utc>::from_timestamp(first.timestamp(), 0).unwrap_or(first);
    let buckets = usize::try_from((last - origin).num_seconds().div_euclid(width) + 1).unwrap_or(1);
    Aligned {
        bucket_secs: Some(width),
        left: resample(left, origin, width, buckets, left_fill),
        right: resample(right, origin, width, buckets, right_fill),
    }
}
