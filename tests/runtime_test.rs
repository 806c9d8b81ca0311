// ==========================================
// 运行时集成测试
// ==========================================
// 职责: 验证 worker 串行处理、命令路由、关停排空与对端上报
// ==========================================


#[cfg(test)]
mod runtime_test {
    use std::error::Error;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use factory_mms::config::EngineConfig;
    use factory_mms::domain::types::{FactoryBand, OrderStatus, ReasonCode, SensorStatus};
    use factory_mms::domain::SensorEvent;
    use factory_mms::engine::{EngineError, FactoryStatusReport, OptionalStatusReporter, StatusReporter};
    use factory_mms::runtime::EngineRuntime;
    use tokio::sync::mpsc;

    use crate::test_helpers::*;

    /// 扫描定时器不在测试期间触发
    fn quiet_config() -> EngineConfig {
        EngineConfig {
            sweep_period_ms: 3_600_000,
            ..EngineConfig::default()
        }
    }

    struct RecordingReporter {
        tx: mpsc::UnboundedSender<FactoryStatusReport>,
    }

    #[async_trait]
    impl StatusReporter for RecordingReporter {
        async fn report_status(&self, report: &FactoryStatusReport) -> Result<(), Box<dyn Error + Send + Sync>> {
            self.tx.send(report.clone())?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_events_drive_failover_through_workers() {
        let env = setup_env_with(quiet_config(), &[("F1", 5), ("F2", 5)]);
        let (_, admission) = env.core.submit_order(&new_order(10), None, t(0)).unwrap();
        let assignment_id = admission.assignments()[0].assignment_id.clone();
        assert_eq!(admission.assignments()[0].factory_id, "F1");

        let handle = EngineRuntime::start(env.core.clone(), OptionalStatusReporter::none()).unwrap();
        assert_eq!(handle.factories().await, vec!["F1".to_string(), "F2".to_string()]);

        for n in 1..=3 {
            let event = SensorEvent::failure("F1", &sensor_id("F1", n), t(n as i64));
            assert!(handle.submit_event(event).await);
        }

        // 同一工厂队列按序处理: 覆写返回时前面的失效事件已处理
        let outcome = handle
            .override_sensor("F1", "F1-S05", SensorStatus::Warning, 30, t(4))
            .await
            .unwrap();
        assert_eq!(outcome.transitions.len(), 1);

        let status = env.core.get_factory_status("F1").unwrap();
        assert_eq!(status.band, FactoryBand::Critical);
        assert!(!status.admission_enabled);

        let moved = env
            .core
            .repos()
            .order_repo
            .find_assignment(&assignment_id)
            .unwrap()
            .unwrap();
        assert_eq!(moved.factory_id, "F2");

        let progress = handle.record_progress(&assignment_id, 10, t(5)).await.unwrap();
        assert!(progress.completed);
        assert_eq!(progress.order_status, OrderStatus::Completed);

        handle.shutdown().await.unwrap();

        let events = env.core.failover_events("F1", 10).unwrap();
        assert!(events.iter().any(|e| e.reason == ReasonCode::Migrated));
        assert_eq!(env.core.get_factory_status("F2").unwrap().load, 0);
    }

    #[tokio::test]
    async fn test_routing_errors_keep_workers_alive() {
        let env = setup_env_with(quiet_config(), &[("F1", 3)]);
        let handle = EngineRuntime::start(env.core.clone(), OptionalStatusReporter::none()).unwrap();

        assert!(!handle.submit_event(SensorEvent::failure("F9", "F9-S01", t(1))).await);
        assert!(matches!(
            handle
                .override_sensor("F9", "F9-S01", SensorStatus::Failed, 30, t(1))
                .await,
            Err(EngineError::UnknownFactory(_))
        ));
        assert!(matches!(
            handle.record_progress("missing", 1, t(1)).await,
            Err(EngineError::UnknownAssignment(_))
        ));
        assert!(matches!(
            handle
                .override_sensor("F1", "F1-S09", SensorStatus::Failed, 30, t(1))
                .await,
            Err(EngineError::UnknownSensor(_))
        ));

        // 命令级错误不终止 worker
        let outcome = handle
            .override_sensor("F1", "F1-S01", SensorStatus::Failed, 30, t(2))
            .await
            .unwrap();
        assert_eq!(outcome.transitions[0].to, SensorStatus::Failed);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_drains_queued_commands() {
        let env = setup_env_with(quiet_config(), &[("F1", 2)]);
        let handle = EngineRuntime::start(env.core.clone(), OptionalStatusReporter::none()).unwrap();

        assert!(
            handle
                .submit_event(SensorEvent::reading("F1", "F1-S01", NOMINAL_LEVEL, t(1)))
                .await
        );
        handle.sweep_all(t(7)).await;
        handle.shutdown().await.unwrap();

        // S01 超时判定失效; S02 从未上报, 不参与超时扫描
        let summary = env.core.get_factory_sensors("F1").unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.ok, 1);
        assert_eq!(summary.sensors[0].status, SensorStatus::Failed);
    }

    #[tokio::test]
    async fn test_band_change_reported_to_peer() {
        let env = setup_env_with(quiet_config(), &[("F1", 5)]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let reporter = OptionalStatusReporter::with_reporter(Arc::new(RecordingReporter { tx }));
        let handle = EngineRuntime::start(env.core.clone(), reporter).unwrap();

        for n in 1..=2 {
            let event = SensorEvent::failure("F1", &sensor_id("F1", n), t(n as i64));
            assert!(handle.submit_event(event).await);
        }

        let report = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.factory_id, "F1");
        assert_eq!(report.previous_band, FactoryBand::Operational);
        assert_eq!(report.band, FactoryBand::Degraded);
        assert_eq!(report.reason, "degraded");
        assert_eq!(report.health_percentage, 60.0);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_provision_while_running() {
        let env = setup_env_with(quiet_config(), &[("F1", 5)]);
        let mut handle = EngineRuntime::start(env.core.clone(), OptionalStatusReporter::none()).unwrap();

        // 新工厂: 开通后即可路由事件
        assert!(!handle.submit_event(SensorEvent::failure("F2", "F2-S01", t(1))).await);
        let sensors = handle.provision_factory(provision_request("F2", 2), t(1)).await.unwrap();
        assert_eq!(sensors.len(), 2);
        assert_eq!(handle.factories().await, vec!["F1".to_string(), "F2".to_string()]);
        assert!(handle.submit_event(SensorEvent::failure("F2", "F2-S01", t(2))).await);

        // 已运行工厂: 经 worker 开通, 新传感器立即参与事件处理
        for n in 1..=3 {
            let event = SensorEvent::failure("F1", &sensor_id("F1", n), t(n as i64));
            assert!(handle.submit_event(event).await);
        }
        handle.provision_factory(provision_request("F1", 15), t(5)).await.unwrap();
        assert!(handle.submit_event(SensorEvent::failure("F1", "F1-S06", t(6))).await);
        let outcome = handle
            .override_sensor("F1", "F1-S07", SensorStatus::Warning, 30, t(7))
            .await
            .unwrap();
        assert_eq!(outcome.transitions.len(), 1);

        handle.shutdown().await.unwrap();

        let f1 = env.core.get_factory_sensors("F1").unwrap();
        assert_eq!(f1.sensors.len(), 15);
        assert_eq!(f1.failed, 4);
        assert_eq!(env.core.get_factory_sensors("F2").unwrap().failed, 1);
        // 11 个健康中 1 个 WARNING: 10/15
        let status = env.core.get_factory_status("F1").unwrap();
        assert_eq!(status.band, FactoryBand::Degraded);
    }
}
