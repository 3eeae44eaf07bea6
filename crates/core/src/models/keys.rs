use super::TaskPriority;

pub const TASK_KEY_PATTERN: &str = "task:*";
pub const JOB_KEY_PATTERN: &str = "scheduled_job:*";

pub fn task_key(task_id: &str) -> String {
    format!("task:{task_id}")
}

pub fn queue_key(queue_name: &str, priority: TaskPriority) -> String {
    format!("queue:{queue_name}:{}", priority.as_str())
}

pub fn delayed_queue_key(queue_name: &str) -> String {
    format!("queue:{queue_name}:delayed")
}

pub fn job_key(job_id: &str) -> String {
    format!("scheduled_job:{job_id}")
}
