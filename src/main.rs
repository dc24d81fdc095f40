//! # Task System Demo
//!
//! Native entry point of the demo binary. It calls into the library's `run()` function,
//! which sets up logging, starts a task system and drives a frame loop with it.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --release -- [config.json]
//! ```

fn main() {
    task_system::run();
}
