
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, h, m, s).unwrap()
    }

    fn window(start: DateTime<Utc>) -> FireWindow {
        FireWindow { start, end: None }
    }

    #[test]
    fn test_cron_accepts_five_fields() {
        let schedule = Schedule::cron("30 9 * * *").unwrap();
        let first = schedule.first_fire_time(&window(at(8, 0, 0))).unwrap();
        assert_eq!(first, at(9, 30, 0));
    }

    #[test]
    fn test_cron_rejects_garbage() {
        let err = Schedule::cron("every tuesday").unwrap_err();
        assert!(matches!(err, StoreError::InvalidSchedule(_)));
    }

    #[test]
    fn test_cron_first_fire_includes_start() {
        let schedule = Schedule::cron("0 * * * * *").unwrap();
        let first = schedule.first_fire_time(&window(at(10, 5, 0))).unwrap();
        assert_eq!(first, at(10, 5, 0));
        let next = schedule.fire_time_after(first, &window(at(10, 5, 0))).unwrap();
        assert_eq!(next, at(10, 6, 0));
    }

    #[test]
    fn test_interval_grid_and_repeat_limit() {
        let schedule = Schedule::interval_repeating(Duration::seconds(10), 2);
        let w = window(at(0, 0, 0));
        assert_eq!(schedule.first_fire_time(&w), Some(at(0, 0, 0)));
        assert_eq!(schedule.fire_time_after(at(0, 0, 0), &w), Some(at(0, 0, 10)));
        assert_eq!(schedule.fire_time_after(at(0, 0, 15), &w), Some(at(0, 0, 20)));
        assert_eq!(schedule.fire_time_after(at(0, 0, 20), &w), None);
    }

    #[test]
    fn test_zero_interval_is_invalid() {
        assert!(Schedule::interval(Duration::zero()).validate().is_err());
    }

    #[test]
    fn test_end_time_bounds_fire_times() {
        let schedule = Schedule::interval(Duration::minutes(1));
        let w = FireWindow {
            start: at(0, 0, 0),
            end: Some(at(0, 1, 30)),
        };
        assert_eq!(schedule.fire_time_after(at(0, 0, 0), &w), Some(at(0, 1, 0)));
        assert_eq!(schedule.fire_time_after(at(0, 1, 0), &w), None);
    }

    #[test]
    fn test_once_fires_a_single_time() {
        let schedule = Schedule::once(at(12, 0, 0));
        let w = window(at(11, 0, 0));
        assert_eq!(schedule.first_fire_time(&w), Some(at(12, 0, 0)));
        assert_eq!(schedule.fire_time_after(at(12, 0, 0), &w), None);
    }

    #[test]
    fn test_daily_rolls_over_midnight() {
        let schedule = Schedule::daily(NaiveTime::from_hms_opt(6, 0, 0).unwrap());
        let w = window(at(7, 0, 0));
        let first = schedule.first_fire_time(&w).unwrap();
        assert_eq!(first, Utc.with_ymd_and_hms(2024, 3, 2, 6, 0, 0).unwrap());
    }

    #[test]
    fn test_smart_policy_per_kind() {
        let once = Schedule::once(at(1, 0, 0));
        let interval = Schedule::interval(Duration::seconds(5));
        assert_eq!(once.effective_policy(MisfirePolicy::Smart), MisfirePolicy::FireNow);
        assert_eq!(
            interval.effective_policy(MisfirePolicy::Smart),
            MisfirePolicy::DoNothing
        );
        assert_eq!(
            interval.effective_policy(MisfirePolicy::FireNow),
            MisfirePolicy::FireNow
        );
    }

    #[test]
    fn test_misfire_do_nothing_skips_to_next_occurrence() {
        let schedule = Schedule::cron("0 */5 * * * *").unwrap();
        let w = window(at(0, 0, 0));
        let next = schedule.next_after_misfire(
            MisfirePolicy::DoNothing,
            Some(at(0, 5, 0)),
            at(0, 17, 0),
            &w,
        );
        assert_eq!(next, Some(at(0, 20, 0)));
    }

    #[test]
    fn test_misfire_fire_now_on_exhausted_trigger_stays_exhausted() {
        let schedule = Schedule::once(at(1, 0, 0));
        let w = window(at(0, 0, 0));
        assert_eq!(
            schedule.next_after_misfire(MisfirePolicy::FireNow, None, at(2, 0, 0), &w),
            None
        );
        assert_eq!(
            schedule.next_after_misfire(MisfirePolicy::FireNow, Some(at(1, 0, 0)), at(2, 0, 0), &w),
            Some(at(2, 0, 0))
        );
    }

    #[test]
    fn test_schedule_serde_tagging() {
        let schedule = Schedule::interval_repeating(Duration::seconds(2), 3);
        let json = serde_json::to_value(&schedule).unwrap();
        assert_eq!(json["type"], "interval");
        assert_eq!(json["every_ms"], 2000);
        let back: Schedule = serde_json::from_value(json).unwrap();
        assert_eq!(back, schedule);
    }
