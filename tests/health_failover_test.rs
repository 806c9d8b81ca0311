// ==========================================
// 健康聚合与故障转移集成测试
// ==========================================
// 职责: 验证 传感器事件 → 健康度/档位 → 传感器替换/工厂迁移 的完整链路
// ==========================================


#[cfg(test)]
mod health_failover_test {
    use factory_mms::domain::types::{AssignmentStatus, FactoryBand, ReasonCode, SensorStatus};
    use factory_mms::domain::SensorEvent;
    use factory_mms::engine::{AdmissionOutcome, EngineError, PendingReason, RerouteOutcome};

    use crate::test_helpers::*;

    // ==========================================
    // 健康度与档位
    // ==========================================

    #[test]
    fn test_four_of_twenty_failed_stays_operational() {
        let env = setup_env(&[("F1", 20)]);
        let mut monitor = env.monitor("F1");

        let outcomes = fail_sensors(&mut monitor, 4, 0);
        assert!(outcomes.iter().all(|o| o.band_change.is_none()));

        let last = outcomes.last().unwrap().health.clone().unwrap();
        assert_eq!(last.health_percentage, 80.0);
        assert_eq!(last.band, FactoryBand::Operational);

        let status = env.core.get_factory_status("F1").unwrap();
        assert_eq!(status.band, FactoryBand::Operational);
        assert_eq!(status.health_percentage, 80.0);
        assert_eq!(status.capacity, 5);
    }

    #[test]
    fn test_eleven_of_twenty_failed_migrates_work() {
        let env = setup_env(&[("F1", 20), ("F2", 20)]);
        let (order, admission) = env.core.submit_order(&new_order(100), None, t(0)).unwrap();
        let assignment = admission.assignments()[0].clone();
        assert_eq!(assignment.factory_id, "F1");

        let mut monitor = env.monitor("F1");
        let outcomes = fail_sensors(&mut monitor, 11, 0);

        // 第 5 个失效进入 DEGRADED, 第 11 个进入 CRITICAL
        let changes: Vec<_> = outcomes.iter().filter_map(|o| o.band_change).collect();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].to, FactoryBand::Degraded);
        assert_eq!(changes[1].to, FactoryBand::Critical);

        let last = outcomes.last().unwrap();
        assert_eq!(last.health.as_ref().unwrap().health_percentage, 45.0);
        let report = last.reschedule.as_ref().unwrap();
        assert!(report.is_complete());
        assert_eq!(report.migrated.len(), 1);
        assert_eq!(report.migrated[0].to_factory, "F2");
        assert_eq!(report.migrated[0].assignment_id, assignment.assignment_id);

        let detail = env.core.get_order(&order.order_id).unwrap();
        assert_eq!(detail.assignments.len(), 1);
        let moved = &detail.assignments[0];
        assert_eq!(moved.factory_id, "F2");
        assert_eq!(moved.queue_position, 1);
        assert_eq!(moved.sensor_id.as_deref(), Some("F2-S01"));
        assert!(moved.status.is_active());

        let f1 = env.core.get_factory_status("F1").unwrap();
        let f2 = env.core.get_factory_status("F2").unwrap();
        assert_eq!(f1.load, 0);
        assert!(!f1.admission_enabled);
        assert_eq!(f1.capacity, 0);
        assert_eq!(f2.load, 1);

        let events = env.core.failover_events("F1", 100).unwrap();
        assert!(events
            .iter()
            .any(|e| e.reason == ReasonCode::Migrated && e.target_factory_id.as_deref() == Some("F2")));
        let health = env.core.health_events("F1", 100).unwrap();
        assert!(health.iter().any(|e| e.reason == ReasonCode::AdmissionSuspended));
    }

    #[test]
    fn test_zero_eligible_sensors_is_down() {
        let env = setup_env(&[("F1", 2)]);
        let mut monitor = env.monitor("F1");
        monitor
            .handle_event(&SensorEvent::at_risk("F1", "F1-S01", t(1)))
            .unwrap();
        let outcome = monitor
            .handle_event(&SensorEvent::at_risk("F1", "F1-S02", t(2)))
            .unwrap();
        assert_eq!(outcome.health.unwrap().band, FactoryBand::Down);

        let summary = env.core.get_factory_sensors("F1").unwrap();
        assert_eq!(summary.warning, 2);
        assert_eq!(summary.at_risk, vec!["F1-S01".to_string(), "F1-S02".to_string()]);
    }

    // ==========================================
    // 传感器级替换
    // ==========================================

    #[test]
    fn test_sensor_failover_keeps_completed_quantity() {
        let env = setup_env(&[("F1", 3)]);
        let (order, admission) = env.core.submit_order(&new_order(100), None, t(0)).unwrap();
        let assignment_id = admission.assignments()[0].assignment_id.clone();

        let mut monitor = env.monitor("F1");
        let outcome = monitor
            .handle_event(&SensorEvent::production("F1", "F1-S01", NOMINAL_LEVEL, 40, t(1)))
            .unwrap();
        let progress = outcome.progress.unwrap();
        assert_eq!(progress.assignment.completed_quantity, 40);
        assert_eq!(progress.assignment.status, AssignmentStatus::InProgress);

        let outcome = monitor
            .handle_event(&SensorEvent::failure("F1", "F1-S01", t(2)))
            .unwrap();
        assert_eq!(outcome.rerouted.len(), 1);
        match &outcome.rerouted[0] {
            RerouteOutcome::Replaced { assignment_id: id, to_sensor, .. } => {
                assert_eq!(id, &assignment_id);
                assert_eq!(to_sensor, "F1-S02");
            }
            other => panic!("Expected Replaced, got {:?}", other),
        }

        let detail = env.core.get_order(&order.order_id).unwrap();
        let a = &detail.assignments[0];
        assert_eq!(a.sensor_id.as_deref(), Some("F1-S02"));
        assert_eq!(a.completed_quantity, 40);
        assert_eq!(a.factory_id, "F1");

        let events = env.core.failover_events("F1", 10).unwrap();
        assert_eq!(events[0].reason, ReasonCode::SensorReplaced);
        assert_eq!(events[0].sensor_id.as_deref(), Some("F1-S01"));
        assert_eq!(events[0].replacement_sensor_id.as_deref(), Some("F1-S02"));
    }

    #[test]
    fn test_sensor_exhaustion_blocks_then_resumes() {
        let env = setup_env(&[("F1", 2)]);
        let (order, _) = env.core.submit_order(&new_order(50), None, t(0)).unwrap();

        let mut monitor = env.monitor("F1");
        let outcomes = fail_sensors(&mut monitor, 2, 0);
        assert!(outcomes[1].rerouted[0].is_blocked());

        // 单工厂: 迁移无目标, 分配留在原工厂
        let report = outcomes[1].reschedule.as_ref().unwrap();
        assert_eq!(report.deferred.len(), 1);

        let detail = env.core.get_order(&order.order_id).unwrap();
        let a = &detail.assignments[0];
        assert!(a.blocked);
        assert!(a.sensor_id.is_none());
        assert_eq!(a.factory_id, "F1");

        let reasons: Vec<ReasonCode> = env
            .core
            .failover_events("F1", 10)
            .unwrap()
            .iter()
            .map(|e| e.reason)
            .collect();
        assert!(reasons.contains(&ReasonCode::SensorExhausted));
        assert!(reasons.contains(&ReasonCode::MigrationDeferred));

        let outcome = monitor
            .handle_event(&SensorEvent::restart("F1", Some("F1-S01"), t(10)))
            .unwrap();
        assert_eq!(outcome.rerouted.len(), 1);
        assert!(!outcome.rerouted[0].is_blocked());

        let detail = env.core.get_order(&order.order_id).unwrap();
        let a = &detail.assignments[0];
        assert!(!a.blocked);
        assert_eq!(a.sensor_id.as_deref(), Some("F1-S01"));
    }

    #[test]
    fn test_at_risk_sensor_never_chosen() {
        let env = setup_env(&[("F1", 3)]);
        let (order, _) = env.core.submit_order(&new_order(10), None, t(0)).unwrap();
        let mut monitor = env.monitor("F1");

        monitor
            .handle_event(&SensorEvent::at_risk("F1", "F1-S02", t(1)))
            .unwrap();
        monitor
            .handle_event(&SensorEvent::failure("F1", "F1-S01", t(2)))
            .unwrap();

        let a = &env.core.get_order(&order.order_id).unwrap().assignments[0];
        assert_eq!(a.sensor_id.as_deref(), Some("F1-S03"));
    }

    // ==========================================
    // 迁移延后与扫描重试
    // ==========================================

    #[test]
    fn test_deferred_migration_retried_on_sweep() {
        let env = setup_env(&[("F1", 5), ("F2", 5)]);
        let (_, on_f1) = env.core.submit_order(&new_order(10), Some("F1"), t(0)).unwrap();
        let (_, on_f2) = env.core.submit_order(&new_order(10), Some("F2"), t(0)).unwrap();
        let f1_assignment = on_f1.assignments()[0].assignment_id.clone();
        let f2_assignment = on_f2.assignments()[0].assignment_id.clone();

        // F2: 60% DEGRADED, 降额 1, 已有 1 个分配 → 不可准入
        let mut f2 = env.monitor("F2");
        fail_sensors(&mut f2, 2, 0);
        assert_eq!(env.core.get_factory_status("F2").unwrap().band, FactoryBand::Degraded);

        // F1: 40% CRITICAL, 无目标 → 延后
        let mut f1 = env.monitor("F1");
        let outcomes = fail_sensors(&mut f1, 3, 10);
        let report = outcomes.last().unwrap().reschedule.as_ref().unwrap();
        assert_eq!(report.deferred, vec![f1_assignment.clone()]);
        assert_eq!(
            env.core.repos().event_log_repo
                .count_failover_events("F1", ReasonCode::MigrationDeferred)
                .unwrap(),
            1
        );

        // 扫描重试仍无目标: 不重复记录延后事件
        let outcome = f1.sweep(t(14)).unwrap();
        assert_eq!(outcome.reschedule.as_ref().unwrap().deferred.len(), 1);
        assert_eq!(
            env.core.repos().event_log_repo
                .count_failover_events("F1", ReasonCode::MigrationDeferred)
                .unwrap(),
            1
        );

        // F2 完成在制分配, 释放唯一槽位
        let progress = env.core.record_progress(&f2_assignment, 10, t(15)).unwrap();
        assert!(progress.completed);

        let outcome = f1.sweep(t(15)).unwrap();
        let report = outcome.reschedule.unwrap();
        assert!(report.is_complete());
        assert_eq!(report.migrated[0].to_factory, "F2");

        let moved = env
            .core
            .repos()
            .order_repo
            .find_assignment(&f1_assignment)
            .unwrap()
            .unwrap();
        assert_eq!(moved.factory_id, "F2");
        assert_eq!(env.core.get_factory_status("F2").unwrap().load, 1);
        assert_eq!(env.core.get_factory_status("F1").unwrap().load, 0);
    }

    // ==========================================
    // 恢复门控
    // ==========================================

    #[test]
    fn test_recovery_requires_consecutive_operational_sweeps() {
        let env = setup_env(&[("F1", 5)]);
        let mut monitor = env.monitor("F1");
        fail_sensors(&mut monitor, 3, 0);
        assert!(!env.core.get_factory_status("F1").unwrap().admission_enabled);

        let (order, admission) = env.core.submit_order(&new_order(20), None, t(5)).unwrap();
        assert_eq!(
            admission,
            AdmissionOutcome::Pending {
                reason: PendingReason::NoEligibleFactory
            }
        );

        // 全厂重启: 立即恢复 OPERATIONAL, 但准入仍关闭
        let outcome = monitor.handle_event(&SensorEvent::restart("F1", None, t(10))).unwrap();
        assert_eq!(outcome.transitions.len(), 3);
        assert_eq!(outcome.band_change.unwrap().to, FactoryBand::Operational);
        let status = env.core.get_factory_status("F1").unwrap();
        assert_eq!(status.band, FactoryBand::Operational);
        assert!(!status.admission_enabled);
        assert_eq!(status.capacity, 0);

        for i in 1..5 {
            let outcome = monitor.sweep(t(11)).unwrap();
            let recovery = outcome.recovery.unwrap();
            assert!(!recovery.confirmed);
            assert_eq!(recovery.recovery_streak, i);
        }

        let outcome = monitor.sweep(t(11)).unwrap();
        assert!(outcome.recovery.unwrap().confirmed);
        assert_eq!(outcome.admitted.len(), 1);
        assert_eq!(outcome.admitted[0].0, order.order_id);
        assert!(outcome.admitted[0].1.is_assigned());

        let status = env.core.get_factory_status("F1").unwrap();
        assert!(status.admission_enabled);
        assert_eq!(status.load, 1);
        let health = env.core.health_events("F1", 100).unwrap();
        assert!(health.iter().any(|e| e.reason == ReasonCode::RecoveryConfirmed));
    }

    #[test]
    fn test_non_operational_sweep_resets_streak() {
        let env = setup_env(&[("F1", 5)]);
        let mut monitor = env.monitor("F1");
        fail_sensors(&mut monitor, 3, 0);
        monitor.handle_event(&SensorEvent::restart("F1", None, t(10))).unwrap();
        monitor.sweep(t(11)).unwrap();
        monitor.sweep(t(11)).unwrap();

        // 再次跌落 DEGRADED: 计数清零
        fail_sensors(&mut monitor, 2, 11);
        let outcome = monitor.sweep(t(14)).unwrap();
        let recovery = outcome.recovery.unwrap();
        assert_eq!(recovery.recovery_streak, 0);
        assert!(!recovery.admission_enabled);
    }

    // ==========================================
    // 心跳超时与人工覆写
    // ==========================================

    #[test]
    fn test_heartbeat_timeout_on_sweep() {
        let env = setup_env(&[("F1", 2)]);
        let mut monitor = env.monitor("F1");
        monitor.handle_event(&SensorEvent::heartbeat("F1", "F1-S01", t(0))).unwrap();

        let outcome = monitor.sweep(t(5)).unwrap();
        assert!(outcome.transitions.is_empty());

        let outcome = monitor.sweep(t(6)).unwrap();
        assert_eq!(outcome.transitions.len(), 1);
        assert_eq!(outcome.transitions[0].reason, ReasonCode::HeartbeatTimeout);
        assert_eq!(outcome.transitions[0].to, SensorStatus::Failed);

        // 从未上报的传感器不参与超时
        let summary = env.core.get_factory_sensors("F1").unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.ok, 1);
    }

    #[test]
    fn test_override_validation() {
        let env = setup_env(&[("F1", 3)]);
        let mut monitor = env.monitor("F1");

        assert!(matches!(
            monitor.override_sensor("F1-S09", SensorStatus::Failed, 60, t(1)),
            Err(EngineError::UnknownSensor(_))
        ));
        assert!(matches!(
            monitor.override_sensor("F1-S01", SensorStatus::Failed, 0, t(1)),
            Err(EngineError::InvalidInput(_))
        ));
        assert!(matches!(
            monitor.override_sensor("F1-S01", SensorStatus::Ok, 60, t(1)),
            Err(EngineError::InvalidInput(_))
        ));

        let outcome = monitor
            .override_sensor("F1-S01", SensorStatus::Failed, 60, t(1))
            .unwrap();
        assert_eq!(outcome.transitions[0].reason, ReasonCode::ManualOverride);

        // 保持期内正常读数不能恢复
        let outcome = monitor
            .handle_event(&SensorEvent::reading("F1", "F1-S01", NOMINAL_LEVEL, t(40)))
            .unwrap();
        assert!(outcome.transitions.is_empty());
        let summary = env.core.get_factory_sensors("F1").unwrap();
        assert_eq!(summary.failed, 1);
    }

    #[test]
    fn test_monitor_reload_keeps_sensor_state() {
        let env = setup_env(&[("F1", 4)]);
        {
            let mut monitor = env.monitor("F1");
            fail_sensors(&mut monitor, 1, 0);
        }
        let monitor = env.monitor("F1");
        let s = monitor.tracker().sensor("F1-S01").unwrap();
        assert_eq!(s.status, SensorStatus::Failed);
        assert_eq!(s.status_reason, Some(ReasonCode::ReportedFailure));
    }

    // ==========================================
    // 运行期间追加传感器
    // ==========================================

    #[test]
    fn test_event_for_sensor_provisioned_after_load() {
        let env = setup_env(&[("F1", 5)]);
        let mut monitor = env.monitor("F1");
        fail_sensors(&mut monitor, 3, 0);
        assert_eq!(env.core.get_factory_status("F1").unwrap().band, FactoryBand::Critical);

        let sensors = env.core.provision_factory(&provision_request("F1", 15), t(5)).unwrap();
        assert_eq!(sensors.len(), 15);
        let status = env.core.get_factory_status("F1").unwrap();
        assert_eq!(status.health_percentage, 80.0);
        assert_eq!(status.band, FactoryBand::Operational);

        // 已加载的监控器收到新传感器事件时纳入跟踪
        let outcome = monitor
            .handle_event(&SensorEvent::failure("F1", "F1-S06", t(10)))
            .unwrap();
        assert_eq!(outcome.transitions.len(), 1);
        let health = outcome.health.unwrap();
        assert_eq!(health.total_sensors, 15);
        assert_eq!(health.ok_sensors, 11);
        assert_eq!(health.band, FactoryBand::Degraded);
        assert_eq!(monitor.tracker().snapshot().len(), 15);

        let outcome = monitor.sweep(t(20)).unwrap();
        let health = outcome.health.unwrap();
        assert_eq!(health.total_sensors, 15);
        assert_eq!(health.band, FactoryBand::Degraded);
        assert_eq!(env.core.get_factory_sensors("F1").unwrap().failed, 4);
    }

    #[test]
    fn test_sweep_includes_provisioned_sensors() {
        let env = setup_env(&[("F1", 5)]);
        let mut monitor = env.monitor("F1");
        fail_sensors(&mut monitor, 3, 0);
        env.core.provision_factory(&provision_request("F1", 15), t(5)).unwrap();

        let outcome = monitor.sweep(t(6)).unwrap();
        let health = outcome.health.unwrap();
        assert_eq!(health.total_sensors, 15);
        assert_eq!(health.health_percentage, 80.0);
        assert_eq!(health.band, FactoryBand::Operational);
        assert!(outcome.band_change.is_none());
        assert!(monitor.tracker().sensor("F1-S15").is_some());
    }

    #[test]
    fn test_sync_provisioned_registers_sensors() {
        let env = setup_env(&[("F1", 2)]);
        let mut monitor = env.monitor("F1");
        env.core.provision_factory(&provision_request("F1", 4), t(1)).unwrap();

        assert_eq!(monitor.refresh_sensors().unwrap(), 2);
        assert_eq!(monitor.refresh_sensors().unwrap(), 0);
        let outcome = monitor.sync_provisioned(t(2)).unwrap();
        assert_eq!(outcome.health.unwrap().total_sensors, 4);
    }
}
