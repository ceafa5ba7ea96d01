pub const APP_NAME: &str = "mi-replay";

pub const DEFAULT_LOG_DIR: &str = "/tmp/mi-replay/logs";

pub const DEFAULT_FIRST_TOKEN: u64 = 1;
