//! Cross-cutting tests that don't belong to one module in particular.
//! Per-module logic (key formatting, backoff math, the pause gate, timer
//! generations...) is tested alongside its own source file instead.

use crate::config::QueueConfig;
use crate::job::{Backoff, JobOpts};
use crate::keys::KeyNamer;

#[test]
fn job_opts_round_trip_through_json() {
    let opts = JobOpts {
        delay: 1_000,
        priority: 5,
        attempts: 3,
        backoff: Some(Backoff::Exponential { delay_ms: 500 }),
        remove_on_complete: false,
        remove_on_fail: true,
        job_id: Some("custom-id".into()),
    };

    let encoded = serde_json::to_string(&opts).expect("serializes");
    let decoded: JobOpts = serde_json::from_str(&encoded).expect("deserializes");

    assert_eq!(decoded.delay, 1_000);
    assert_eq!(decoded.priority, 5);
    assert_eq!(decoded.attempts, 3);
    assert_eq!(decoded.job_id.as_deref(), Some("custom-id"));
}

#[test]
fn default_job_opts_match_documented_defaults() {
    let opts = JobOpts::default();
    assert_eq!(opts.attempts, 1);
    assert_eq!(opts.priority, 0);
    assert!(opts.remove_on_complete);
    assert!(!opts.remove_on_fail);
}

#[test]
fn queue_config_and_key_namer_agree_on_the_prefix() {
    let config = QueueConfig::from_url("redis://localhost/0");
    let keys = KeyNamer::new(config.key_prefix.clone(), "emails");
    assert_eq!(keys.wait(), "bull:emails:wait");
}
