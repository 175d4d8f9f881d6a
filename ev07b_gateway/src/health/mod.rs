pub mod status;

pub use status::spawn_status_reporter;
