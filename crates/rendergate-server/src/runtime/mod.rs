pub mod console;
pub mod sandbox;
pub mod timers;

mod bindings;
mod conversions;


pub use console::{ConsoleLevel, SandboxConsole};
pub use conversions::{js_value_to_json, json_to_js_value};
pub use sandbox::{Sandbox, SandboxLimits};
pub use timers::{DueTimer, TimerGuard};
