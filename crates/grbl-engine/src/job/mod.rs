//! The job runner (§4.10): streams a parsed program block-by-block with
//! pause/resume and crash-recovery semantics.

pub mod runner;
