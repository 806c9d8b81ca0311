// ==========================================
// 订单准入/进度/取消集成测试
// ==========================================
// 职责: 验证 准入拆分 → 产能上限 → 进度推进/队列压缩 → 取消 的业务规则
// ==========================================


#[cfg(test)]
mod order_admission_test {
    use factory_mms::config::EngineConfig;
    use factory_mms::domain::types::{AssignmentStatus, FactoryBand, OrderStatus};
    use factory_mms::domain::{Factory, SensorEvent};
    use factory_mms::engine::{AdmissionOutcome, EngineError, PendingReason};

    use crate::test_helpers::*;

    // ==========================================
    // 准入与拆分
    // ==========================================

    #[test]
    fn test_split_1200_into_two_slices() {
        let env = setup_env(&[("F1", 5), ("F2", 5), ("F3", 5)]);
        let (order, admission) = env.core.submit_order(&new_order(1200), None, t(0)).unwrap();

        let slices: Vec<(String, u32)> = admission
            .assignments()
            .iter()
            .map(|a| (a.factory_id.clone(), a.assigned_quantity))
            .collect();
        assert_eq!(slices, vec![("F1".to_string(), 1000), ("F2".to_string(), 200)]);

        let detail = env.core.get_order(&order.order_id).unwrap();
        assert_eq!(detail.order.status, OrderStatus::Assigned);
        assert_eq!(detail.assigned_total(), 1200);
        assert!(detail.assignments.iter().all(|a| a.queue_position == 1 && a.sensor_id.is_some()));

        assert_eq!(env.core.get_factory_status("F1").unwrap().load, 1);
        assert_eq!(env.core.get_factory_status("F2").unwrap().load, 1);
        assert_eq!(env.core.get_factory_status("F3").unwrap().load, 0);
        assert_eq!(env.core.repos().order_repo.total_active_quantity().unwrap(), 1200);
    }

    #[test]
    fn test_ranking_prefers_lower_load() {
        let env = setup_env(&[("F1", 5), ("F2", 5)]);
        env.core.submit_order(&new_order(10), None, t(0)).unwrap();
        let (_, second) = env.core.submit_order(&new_order(10), None, t(1)).unwrap();
        assert_eq!(second.assignments()[0].factory_id, "F2");
    }

    #[test]
    fn test_insufficient_capacity_leaves_order_pending() {
        let env = setup_env(&[("F1", 5)]);
        let (order, admission) = env.core.submit_order(&new_order(1500), None, t(0)).unwrap();
        assert_eq!(
            admission,
            AdmissionOutcome::Pending {
                reason: PendingReason::InsufficientCapacity { shortfall: 500 }
            }
        );

        let detail = env.core.get_order(&order.order_id).unwrap();
        assert_eq!(detail.order.status, OrderStatus::Pending);
        assert!(detail.assignments.is_empty());
        assert_eq!(env.core.get_factory_status("F1").unwrap().load, 0);
    }

    #[test]
    fn test_explicit_factory() {
        let env = setup_env(&[("F1", 5), ("F2", 5)]);

        // 指定工厂: 整单落在该工厂, 不受 unit_cap 拆分
        let (_, admission) = env.core.submit_order(&new_order(1500), Some("F2"), t(0)).unwrap();
        let assignments = admission.assignments();
        assert_eq!(assignments.len(), 1);
        assert_eq!(assignments[0].factory_id, "F2");
        assert_eq!(assignments[0].assigned_quantity, 1500);

        let order = env.core.create_order(&new_order(10), t(1)).unwrap();
        assert!(matches!(
            env.core.assign_order(&order.order_id, Some("F9"), t(1)),
            Err(EngineError::UnknownFactory(_))
        ));

        let mut monitor = env.monitor("F1");
        fail_sensors(&mut monitor, 3, 0);
        assert_eq!(
            env.core.assign_order(&order.order_id, Some("F1"), t(5)).unwrap(),
            AdmissionOutcome::Pending {
                reason: PendingReason::FactoryIneligible {
                    factory_id: "F1".to_string()
                }
            }
        );
    }

    #[test]
    fn test_admit_requires_pending_order() {
        let env = setup_env(&[("F1", 5)]);
        let (order, admission) = env.core.submit_order(&new_order(10), None, t(0)).unwrap();
        assert!(admission.is_assigned());

        assert!(matches!(
            env.core.assign_order(&order.order_id, None, t(1)),
            Err(EngineError::InvalidStateTransition { .. })
        ));
        assert!(matches!(
            env.core.assign_order("missing", None, t(1)),
            Err(EngineError::UnknownOrder(_))
        ));
    }

    // ==========================================
    // 产能上限
    // ==========================================

    #[test]
    fn test_load_never_exceeds_operational_capacity() {
        let env = setup_env(&[("F1", 5)]);
        let mut assigned = Vec::new();
        for i in 0..5 {
            let (_, admission) = env.core.submit_order(&new_order(10), None, t(i)).unwrap();
            assigned.push(admission.assignments()[0].clone());
        }
        let positions: Vec<u32> = assigned.iter().map(|a| a.queue_position).collect();
        assert_eq!(positions, vec![1, 2, 3, 4, 5]);
        assert!(assigned[1..].iter().all(|a| a.sensor_id.is_none()));

        let (sixth, admission) = env.core.submit_order(&new_order(10), None, t(10)).unwrap();
        assert_eq!(
            admission,
            AdmissionOutcome::Pending {
                reason: PendingReason::NoEligibleFactory
            }
        );
        assert_eq!(env.core.get_factory_status("F1").unwrap().load, 5);

        // 队首完成 → 释放槽位 → 队列压缩 → pending 订单准入到队尾
        let progress = env
            .core
            .record_progress(&assigned[0].assignment_id, 10, t(20))
            .unwrap();
        assert!(progress.completed);
        assert_eq!(progress.order_status, OrderStatus::Completed);

        let next_head = env
            .core
            .repos()
            .order_repo
            .find_assignment(&assigned[1].assignment_id)
            .unwrap()
            .unwrap();
        assert_eq!(next_head.queue_position, 1);
        assert_eq!(next_head.sensor_id.as_deref(), Some("F1-S01"));

        let detail = env.core.get_order(&sixth.order_id).unwrap();
        assert_eq!(detail.order.status, OrderStatus::Assigned);
        assert_eq!(detail.assignments[0].queue_position, 5);
        assert_eq!(env.core.get_factory_status("F1").unwrap().load, 5);
    }

    #[test]
    fn test_degraded_capacity_is_one() {
        let env = setup_env(&[("F1", 5)]);
        let mut monitor = env.monitor("F1");
        fail_sensors(&mut monitor, 2, 0);
        let status = env.core.get_factory_status("F1").unwrap();
        assert_eq!(status.band, FactoryBand::Degraded);
        assert_eq!(status.capacity, 1);

        let (_, first) = env.core.submit_order(&new_order(10), None, t(5)).unwrap();
        assert!(first.is_assigned());
        let (_, second) = env.core.submit_order(&new_order(10), None, t(6)).unwrap();
        assert!(!second.is_assigned());
    }

    // ==========================================
    // 提交阶段容量冲突
    // ==========================================

    /// F2 先占 2 个槽位, 读取排序快照后 F1 被其他订单占满
    fn stale_view_env(config: EngineConfig) -> (TestEnv, Vec<Factory>) {
        let env = setup_env_with(config, &[("F1", 5), ("F2", 5)]);
        for i in 0..2 {
            env.core.submit_order(&new_order(10), Some("F2"), t(i)).unwrap();
        }
        let view = env.core.repos().factory_repo.list_all().unwrap();
        for i in 0..5 {
            let (_, admission) = env.core.submit_order(&new_order(10), Some("F1"), t(10 + i)).unwrap();
            assert!(admission.is_assigned());
        }
        assert_eq!(env.core.get_factory_status("F1").unwrap().load, 5);
        (env, view)
    }

    #[test]
    fn test_commit_conflict_reranks_to_next_factory() {
        let (env, view) = stale_view_env(EngineConfig::default());
        let order = env.core.create_order(&new_order(10), t(20)).unwrap();

        let admission = env
            .core
            .assignment()
            .admit_with_view(&order.order_id, None, Some(view), t(21))
            .unwrap();
        let assignments = admission.assignments();
        assert_eq!(assignments.len(), 1);
        assert_eq!(assignments[0].factory_id, "F2");
        assert_eq!(assignments[0].queue_position, 3);

        let f1 = env.core.get_factory_status("F1").unwrap();
        assert_eq!(f1.load, 5);
        assert!(f1.load <= f1.capacity);
        assert_eq!(env.core.get_factory_status("F2").unwrap().load, 3);
    }

    #[test]
    fn test_conflict_retries_exhausted_leaves_order_pending() {
        let config = EngineConfig {
            admission_attempts: 1,
            ..EngineConfig::default()
        };
        let (env, view) = stale_view_env(config);
        let order = env.core.create_order(&new_order(10), t(20)).unwrap();

        let admission = env
            .core
            .assignment()
            .admit_with_view(&order.order_id, None, Some(view), t(21))
            .unwrap();
        assert_eq!(
            admission,
            AdmissionOutcome::Pending {
                reason: PendingReason::ConflictRetriesExhausted
            }
        );

        let detail = env.core.get_order(&order.order_id).unwrap();
        assert_eq!(detail.order.status, OrderStatus::Pending);
        assert!(detail.assignments.is_empty());
        assert_eq!(env.core.get_factory_status("F1").unwrap().load, 5);
        assert_eq!(env.core.get_factory_status("F2").unwrap().load, 2);

        // 冲突不影响之后的正常准入
        let admission = env.core.assign_order(&order.order_id, None, t(22)).unwrap();
        assert_eq!(admission.assignments()[0].factory_id, "F2");
    }

    #[test]
    fn test_concurrent_submissions_respect_capacity() {
        let env = setup_env(&[("F1", 5)]);
        let outcomes: Vec<AdmissionOutcome> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let core = env.core.clone();
                    scope.spawn(move || core.submit_order(&new_order(10), None, t(i)).unwrap().1)
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let assigned = outcomes.iter().filter(|o| o.is_assigned()).count();
        assert_eq!(assigned, 5);
        assert!(outcomes.iter().filter(|o| !o.is_assigned()).all(|o| matches!(
            o,
            AdmissionOutcome::Pending {
                reason: PendingReason::NoEligibleFactory | PendingReason::ConflictRetriesExhausted
            }
        )));

        let mut positions: Vec<u32> = outcomes
            .iter()
            .flat_map(|o| o.assignments().iter().map(|a| a.queue_position))
            .collect();
        positions.sort();
        assert_eq!(positions, vec![1, 2, 3, 4, 5]);
        assert_eq!(env.core.get_factory_status("F1").unwrap().load, 5);
    }

    // ==========================================
    // 进度推进
    // ==========================================

    #[test]
    fn test_progress_is_capped_and_order_completes() {
        let env = setup_env(&[("F1", 5), ("F2", 5)]);
        let (order, admission) = env.core.submit_order(&new_order(1200), None, t(0)).unwrap();
        let a1 = admission.assignments()[0].assignment_id.clone();
        let a2 = admission.assignments()[1].assignment_id.clone();

        let p = env.core.record_progress(&a1, 600, t(1)).unwrap();
        assert!(!p.completed);
        assert_eq!(p.order_status, OrderStatus::InProgress);

        let p = env.core.record_progress(&a1, 900, t(2)).unwrap();
        assert!(p.completed);
        assert_eq!(p.assignment.completed_quantity, 1000);
        assert_eq!(p.order_status, OrderStatus::InProgress);

        assert!(matches!(
            env.core.record_progress(&a1, 1, t(3)),
            Err(EngineError::InvalidStateTransition { .. })
        ));

        let p = env.core.record_progress(&a2, 200, t(4)).unwrap();
        assert_eq!(p.order_status, OrderStatus::Completed);

        let detail = env.core.get_order(&order.order_id).unwrap();
        assert!(detail
            .assignments
            .iter()
            .all(|a| a.status == AssignmentStatus::Completed));
        assert_eq!(env.core.get_factory_status("F1").unwrap().load, 0);
        assert_eq!(env.core.get_factory_status("F2").unwrap().load, 0);
    }

    #[test]
    fn test_production_reading_only_from_active_sensor() {
        let env = setup_env(&[("F1", 3)]);
        let (_, admission) = env.core.submit_order(&new_order(10), None, t(0)).unwrap();
        let assignment_id = admission.assignments()[0].assignment_id.clone();
        let mut monitor = env.monitor("F1");

        let outcome = monitor
            .handle_event(&SensorEvent::production("F1", "F1-S02", NOMINAL_LEVEL, 5, t(1)))
            .unwrap();
        assert!(outcome.progress.is_none());

        let outcome = monitor
            .handle_event(&SensorEvent::production("F1", "F1-S01", NOMINAL_LEVEL, 5, t(2)))
            .unwrap();
        assert_eq!(outcome.progress.unwrap().assignment.assignment_id, assignment_id);
    }

    #[test]
    fn test_work_snapshot_tracks_heads() {
        let env = setup_env(&[("F1", 3)]);
        let rx = env.core.snapshot().subscribe();
        let (order, admission) = env.core.submit_order(&new_order(30), None, t(0)).unwrap();

        let snapshot = rx.borrow().clone();
        let slice = snapshot.factories.get("F1").unwrap();
        assert_eq!(slice.order_id, order.order_id);
        assert_eq!(slice.product_type, "Cola-330ml");
        assert_eq!(slice.sensor_id.as_deref(), Some("F1-S01"));

        env.core
            .record_progress(&admission.assignments()[0].assignment_id, 30, t(1))
            .unwrap();
        assert!(env.core.snapshot().current().factories.is_empty());
    }

    // ==========================================
    // 取消
    // ==========================================

    #[test]
    fn test_cancel_releases_every_slice() {
        let env = setup_env(&[("F1", 5), ("F2", 5)]);
        let (order, _) = env.core.submit_order(&new_order(1200), None, t(0)).unwrap();

        let cancelled = env.core.cancel_order(&order.order_id, t(1)).unwrap();
        assert_eq!(cancelled.status, OrderStatus::Cancelled);

        let detail = env.core.get_order(&order.order_id).unwrap();
        assert!(detail
            .assignments
            .iter()
            .all(|a| a.status == AssignmentStatus::Cancelled));
        assert_eq!(env.core.get_factory_status("F1").unwrap().load, 0);
        assert_eq!(env.core.get_factory_status("F2").unwrap().load, 0);
        assert_eq!(env.core.repos().order_repo.total_active_quantity().unwrap(), 0);

        assert!(matches!(
            env.core.cancel_order(&order.order_id, t(2)),
            Err(EngineError::InvalidStateTransition { .. })
        ));
    }

    #[test]
    fn test_cancel_admits_waiting_order() {
        let env = setup_env(&[("F1", 5)]);
        let mut monitor = env.monitor("F1");
        fail_sensors(&mut monitor, 2, 0); // DEGRADED, 容量 1

        let (first, _) = env.core.submit_order(&new_order(10), None, t(5)).unwrap();
        let (second, admission) = env.core.submit_order(&new_order(10), None, t(6)).unwrap();
        assert!(!admission.is_assigned());

        env.core.cancel_order(&first.order_id, t(7)).unwrap();
        let detail = env.core.get_order(&second.order_id).unwrap();
        assert_eq!(detail.order.status, OrderStatus::Assigned);
        assert_eq!(detail.assignments[0].queue_position, 1);
    }
}
