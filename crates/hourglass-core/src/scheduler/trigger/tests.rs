
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn interval_trigger(start: DateTime<Utc>) -> Trigger {
        Trigger::new(
            TriggerKey::new("g", "t1"),
            JobKey::new("g", "j1"),
            Schedule::interval(Duration::seconds(30)),
        )
        .starting_at(start)
    }

    #[test]
    fn test_new_trigger_defaults() {
        let trigger = interval_trigger(Utc::now());
        assert_eq!(trigger.state, TriggerState::Waiting);
        assert_eq!(trigger.priority, DEFAULT_PRIORITY);
        assert_eq!(trigger.misfire_policy, MisfirePolicy::Smart);
        assert!(trigger.next_fire_time.is_none());
    }

    #[test]
    fn test_triggered_advances_schedule() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut trigger = interval_trigger(start);
        trigger.compute_first_fire_time();
        trigger.triggered();

        assert_eq!(trigger.previous_fire_time, Some(start));
        assert_eq!(trigger.next_fire_time, Some(start + Duration::seconds(30)));
        assert_eq!(trigger.times_triggered, 1);
        assert_eq!(
            trigger.execution_complete_instruction(),
            CompletedExecutionInstruction::NoInstruction
        );
    }

    #[test]
    fn test_exhausted_trigger_completes() {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut trigger = Trigger::new(
            TriggerKey::new("g", "once"),
            JobKey::new("g", "j1"),
            Schedule::once(at),
        )
        .starting_at(at);
        trigger.compute_first_fire_time();
        trigger.triggered();
        assert!(trigger.next_fire_time.is_none());
        assert_eq!(
            trigger.execution_complete_instruction(),
            CompletedExecutionInstruction::SetTriggerComplete
        );
    }

    #[test]
    fn test_document_round_trip() {
        let mut trigger = interval_trigger(Utc::now());
        trigger.compute_first_fire_time();
        trigger.triggered();
        trigger.state = TriggerState::Executing;
        trigger.node = "node-a".to_string();

        let value = serde_json::to_value(trigger.document()).unwrap();
        let mut restored = interval_trigger(trigger.start_time);
        restored.apply_document(&value);

        assert_eq!(restored.state, TriggerState::Executing);
        assert_eq!(restored.node, "node-a");
        assert_eq!(restored.next_fire_time, trigger.next_fire_time);
        assert_eq!(restored.previous_fire_time, trigger.previous_fire_time);
        assert_eq!(restored.times_triggered, 1);
    }

    #[test]
    fn test_document_omits_unset_fields() {
        let mut trigger = interval_trigger(Utc::now());
        trigger.node = "n".to_string();
        let value = serde_json::to_value(trigger.document()).unwrap();
        assert_eq!(value, json!({ "node": "n", "state": "WAITING" }));
    }

    #[test]
    fn test_unparsable_document_sets_error_state() {
        let mut trigger = interval_trigger(Utc::now());
        trigger.apply_document(&json!({ "node": "n", "state": "SLEEPING" }));
        assert_eq!(trigger.state, TriggerState::Error);
        assert!(trigger.state_info.unwrap().contains("parsing"));
    }

    #[test]
    fn test_state_status_mapping() {
        assert_eq!(TriggerState::PausedBlocked.status(), TriggerStatus::Paused);
        assert_eq!(TriggerState::Acquired.status(), TriggerStatus::Normal);
        assert_eq!(TriggerState::Blocked.status(), TriggerStatus::Blocked);
    }

    #[test]
    fn test_same_definition_ignores_state() {
        let start = Utc::now();
        let a = interval_trigger(start);
        let mut b = interval_trigger(start);
        b.state = TriggerState::Paused;
        b.times_triggered = 4;
        assert!(a.same_definition(&b));
        assert!(!a.same_definition(&b.clone().with_priority(9)));
    }
