use policy_log::StaticLogConfig;

pub struct PolicyCheckLog;

impl StaticLogConfig for PolicyCheckLog {
    const MAX_LOG_FILES: usize = 14;
    const LOG_FILE_PREFIX: &'static str = "ghe-policy-check";
}
