//! End-to-end scenarios against a real chain container and node binary
//!
//! Every scenario needs a Docker daemon and the node executable named by
//! `NODE_BINARY`, so all of them are ignored by default.
//!
//! Usage:
//!   cargo test -p e2e-tests -- --ignored
//!   cargo test -p e2e-tests registration:: -- --ignored

mod accounts;
mod common;
mod concurrency;
mod registration;

fn main() {
    println!("Node harness end-to-end tests");
    println!("=============================");
    println!();
    println!("Requirements: Docker daemon, node binary on PATH (or NODE_BINARY)");
    println!();
    println!("To run all scenarios:");
    println!("  cargo test -p e2e-tests -- --ignored");
    println!();
    println!("By area:");
    println!("  cargo test -p e2e-tests accounts:: -- --ignored");
    println!("  cargo test -p e2e-tests concurrency:: -- --ignored");
    println!("  cargo test -p e2e-tests registration:: -- --ignored");
}
