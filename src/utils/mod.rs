pub mod utils_time;

pub use utils_time::{backup_stamp, current_time_ms};
