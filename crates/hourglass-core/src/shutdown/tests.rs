
    use super::*;

    #[tokio::test]
    async fn test_shutdown_phases() {
        let controller = ShutdownController::new();
        assert_eq!(controller.phase(), ShutdownPhase::Running);
        assert!(!controller.is_shutting_down());

        assert!(controller.shutdown().await);

        assert_eq!(controller.phase(), ShutdownPhase::Terminated);
        assert!(controller.is_shutting_down());
    }

    #[tokio::test]
    async fn test_execution_guard() {
        let controller = ShutdownController::new();
        assert_eq!(controller.active_executions(), 0);

        {
            let _first = controller.register_execution();
            let _second = controller.register_execution();
            assert_eq!(controller.active_executions(), 2);
        }

        // Guards dropped
        assert_eq!(controller.active_executions(), 0);
    }

    #[tokio::test]
    async fn test_cancellation_propagation() {
        let controller = ShutdownController::new();
        let token = controller.token();
        let guard = controller.register_execution();
        assert!(!token.is_cancelled());

        drop(guard);
        controller.shutdown().await;

        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_waits_for_running_job() {
        let controller = ShutdownController::with_timeout(Duration::from_secs(5));
        let guard = controller.register_execution();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            assert!(guard.is_cancelled());
            drop(guard);
        });

        assert!(controller.shutdown().await);
        assert_eq!(controller.active_executions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_with_stuck_job() {
        let controller = ShutdownController::with_timeout(Duration::from_secs(1));
        let _stuck = controller.register_execution();

        assert!(!controller.shutdown().await);
        assert_eq!(controller.phase(), ShutdownPhase::Terminated);
    }

    #[tokio::test]
    async fn test_double_shutdown() {
        let controller = ShutdownController::new();
        let first = controller.clone();
        let second = controller.clone();

        let (a, b) = tokio::join!(
            tokio::spawn(async move { first.shutdown().await }),
            tokio::spawn(async move { second.shutdown().await }),
        );

        assert!(a.unwrap());
        assert!(b.unwrap());
        assert_eq!(controller.phase(), ShutdownPhase::Terminated);
    }
