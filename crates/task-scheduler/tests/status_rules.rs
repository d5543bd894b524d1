//! 任务状态机与信封集成测试
//!
//! 守卫式转换的合法路径与任务→信封的字段对应是调度语义的根基。

use chrono::{Duration, Utc};
use uuid::Uuid;

use notify_shared::messages::{TaskStatus, TaskType};
use notify_task_scheduler::task::Task;

fn task(status: TaskStatus, attempts: i32) -> Task {
    let now = Utc::now();
    Task {
        id: Uuid::now_v7(),
        task_type: TaskType::CampaignActivate,
        payload: serde_json::json!({"campaignId": Uuid::now_v7()}),
        scheduled_for: now - Duration::seconds(30),
        status,
        attempts,
        max_attempts: 3,
        last_attempt_at: None,
        completed_at: None,
        created_by: Some("campaign-service".to_string()),
        created_at: now,
        updated_at: now,
    }
}

#[test]
fn test_terminal_states_accept_no_transitions() {
    for terminal in [
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ] {
        assert!(terminal.is_terminal());
        for next in [
            TaskStatus::Pending,
            TaskStatus::Processing,
            TaskStatus::Paused,
        ] {
            assert!(!terminal.can_transition_to(next));
        }
    }
}

#[test]
fn test_pause_is_only_reachable_from_pending() {
    assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Paused));
    assert!(!TaskStatus::Processing.can_transition_to(TaskStatus::Paused));
    // 恢复走 PAUSED → PENDING
    assert!(TaskStatus::Paused.can_transition_to(TaskStatus::Pending));
    assert!(!TaskStatus::Paused.can_transition_to(TaskStatus::Processing));
}

#[test]
fn test_retry_path_returns_to_pending() {
    assert!(TaskStatus::Processing.can_transition_to(TaskStatus::Pending));
}

#[test]
fn test_attempt_budget() {
    assert!(task(TaskStatus::Processing, 1).has_attempts_left());
    assert!(task(TaskStatus::Processing, 2).has_attempts_left());
    // attempts == max_attempts 时额度耗尽
    assert!(!task(TaskStatus::Processing, 3).has_attempts_left());
}

#[test]
fn test_envelope_mirrors_task_fields() {
    let t = task(TaskStatus::Pending, 1);
    let message = t.to_message();

    assert_eq!(message.id, t.id.to_string());
    assert_eq!(message.task_type, t.task_type);
    assert_eq!(message.attempts, 1);
    assert_eq!(message.max_attempts, 3);
    assert_eq!(message.payload, t.payload);
}
