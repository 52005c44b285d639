//! End-to-end circulation tests over the in-memory stores, plus row-lock
//! tests against Postgres that only run with `--ignored`

mod circulation;
mod common;
mod concurrency;
mod notifications;
mod postgres;
