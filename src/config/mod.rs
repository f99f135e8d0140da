//! Configuration: the in-memory model and the YAML loader that compiles
//! and validates it.

pub mod loader;
pub mod model;

pub use loader::{load, load_str, Loaded};
pub use model::{
    Command, Config, Defaults, Download, Handler, HealthCheck, Host, HostGroup, Step, Strategy,
    Target, Task, TemplateStep, Upload, WaitFor, LOCAL_TARGET,
};
