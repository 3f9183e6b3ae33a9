//! The one place the coordinator reads the wall clock from, so every
//! script invocation and cache freshness check agrees on "now".

use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs_f64()
}
