//! End-to-end tests across scheduler, bus, quota guard and coordinator.

#[cfg(test)]
mod tests {
    use crate::config::{JobConfig, ProviderQuotaConfig};
    use crate::coordinator::Coordinator;
    use crate::core::{EventKind, EventPayload, FallbackReason, RunFinished, RunKey, RunStatus, StageStatus};
    use crate::errors::{ProviderError, StageError};
    use crate::scheduler::{Scheduler, TriggerOutcome};
    use crate::stages::Stage;
    use crate::system::PipelineSystem;
    use crate::testing::{fast_config, utc, BlockingStage, ScriptedStage, TestHarness};
    use chrono::{DateTime, Utc};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(2);

    struct Pipeline {
        harness: TestHarness,
        scheduler: Arc<Scheduler>,
        coordinator: Arc<Coordinator>,
    }

    fn pipeline(
        providers: &[(&str, u64)],
        jobs: Vec<JobConfig>,
        stages: Vec<Arc<dyn Stage>>,
        now: DateTime<Utc>,
    ) -> Pipeline {
        let mut config = fast_config();
        for (name, limit) in providers {
            config = config.with_provider(ProviderQuotaConfig::new(*name, *limit));
        }
        for job in jobs {
            config = config.with_job(job);
        }
        let harness = TestHarness::new(config, now);
        let scheduler = Scheduler::new(&harness.context).unwrap();
        let coordinator = Coordinator::new(&harness.context, stages);
        coordinator.start();
        Pipeline {
            harness,
            scheduler,
            coordinator,
        }
    }

    async fn finished(pipeline: &Pipeline, kind: EventKind) -> RunFinished {
        let event = pipeline
            .harness
            .sink
            .wait_for_kind(kind, WAIT)
            .await
            .unwrap_or_else(|| panic!("no {kind:?} event"));
        event.as_run_finished().cloned().unwrap()
    }

    fn statuses(finished: &RunFinished) -> Vec<(&str, StageStatus)> {
        finished
            .stages
            .iter()
            .map(|r| (r.stage_name.as_str(), r.status))
            .collect()
    }

    fn scan_stages(fetch: ScriptedStage) -> Vec<Arc<dyn Stage>> {
        vec![
            fetch.into_arc(),
            ScriptedStage::new("Transform").into_arc(),
            ScriptedStage::new("Report").into_arc(),
        ]
    }

    #[tokio::test]
    async fn test_scheduled_run_falls_back_to_secondary() {
        let fetch = ScriptedStage::new("Fetch")
            .requires(["primary", "secondary"])
            .abort_on_failure(true);
        let p = pipeline(
            &[("primary", 0), ("secondary", 100)],
            vec![JobConfig::new("daily-scan", "06:00", "UTC")],
            scan_stages(fetch),
            utc(2026, 6, 1, 6, 0),
        );

        let fired = p.scheduler.tick().await;
        assert_eq!(fired, vec![RunKey::new("daily-scan:2026-06-01")]);

        let done = finished(&p, EventKind::RunCompleted).await;
        assert_eq!(done.status, RunStatus::Succeeded);
        assert_eq!(
            statuses(&done),
            vec![
                ("Fetch", StageStatus::Succeeded),
                ("Transform", StageStatus::Succeeded),
                ("Report", StageStatus::Succeeded),
            ]
        );
        let fetch_output = done.stages[0].output.as_ref().unwrap();
        assert_eq!(fetch_output.produced_by.as_deref(), Some("secondary"));

        let kinds: Vec<EventKind> = p
            .harness
            .sink
            .events_for_run(&fired[0])
            .iter()
            .map(|e| e.kind())
            .collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::RunRequested,
                EventKind::RunStarted,
                EventKind::ProviderFallback,
                EventKind::StageCompleted,
                EventKind::StageCompleted,
                EventKind::StageCompleted,
                EventKind::RunCompleted,
            ]
        );
        let fallback = &p.harness.sink.events_of_kind(EventKind::ProviderFallback)[0];
        assert!(matches!(
            &fallback.payload,
            EventPayload::ProviderFallback { from, to: Some(to), reason: FallbackReason::Exhausted, .. }
                if from == "primary" && to == "secondary"
        ));
        assert_eq!(p.harness.context.quota.snapshot("secondary").unwrap().used, 1);
        assert!(p.harness.context.runs.is_empty());
    }

    #[tokio::test]
    async fn test_aborting_stage_failure_ends_run() {
        let fetch = ScriptedStage::new("Fetch")
            .requires(["primary"])
            .abort_on_failure(true)
            .fail_with(StageError::Provider(ProviderError::permanent("bad credentials")));
        let p = pipeline(
            &[("primary", 10)],
            vec![JobConfig::new("scan", "06:00", "UTC")],
            scan_stages(fetch),
            utc(2026, 6, 1, 7, 0),
        );

        assert!(matches!(
            p.scheduler.trigger_now("scan").await.unwrap(),
            TriggerOutcome::Accepted { .. }
        ));
        let done = finished(&p, EventKind::RunFailed).await;
        assert_eq!(done.status, RunStatus::Failed);
        assert_eq!(statuses(&done), vec![("Fetch", StageStatus::Failed)]);
        assert_eq!(done.reason.as_deref(), Some("stage 'Fetch' failed"));

        let failed = &p.harness.sink.events_of_kind(EventKind::StageFailed)[0];
        assert!(matches!(failed.payload, EventPayload::StageFailed { aborts_run: true, .. }));
        assert_eq!(p.coordinator.status().failed, 1);
    }

    #[tokio::test]
    async fn test_non_aborting_failure_continues() {
        let fetch = ScriptedStage::new("Fetch")
            .requires(["primary"])
            .fail_with(StageError::failed("parse error"));
        let p = pipeline(
            &[("primary", 10)],
            vec![JobConfig::new("scan", "06:00", "UTC")],
            scan_stages(fetch),
            utc(2026, 6, 1, 7, 0),
        );

        p.scheduler.trigger_now("scan").await.unwrap();
        let done = finished(&p, EventKind::RunCompleted).await;
        assert_eq!(done.status, RunStatus::PartiallyFailed);
        assert_eq!(
            statuses(&done),
            vec![
                ("Fetch", StageStatus::Failed),
                ("Transform", StageStatus::Succeeded),
                ("Report", StageStatus::Succeeded),
            ]
        );
        assert_eq!(done.stages[0].error_code(), Some("stage_failed"));
        assert_eq!(done.reason, None);
    }

    #[tokio::test]
    async fn test_trigger_while_running_is_rejected_then_accepted() {
        let blocking = BlockingStage::new("Fetch");
        let p = pipeline(
            &[],
            vec![JobConfig::new("scan", "06:00", "UTC")],
            vec![blocking.clone().into_arc()],
            utc(2026, 6, 1, 7, 0),
        );

        let first = p.scheduler.trigger_now("scan").await.unwrap();
        assert!(matches!(first, TriggerOutcome::Accepted { .. }));
        assert!(blocking.wait_started(WAIT).await);

        let second = p.scheduler.trigger_now("scan").await.unwrap();
        assert_eq!(
            second,
            TriggerOutcome::AlreadyRunning {
                run_key: RunKey::new("scan:2026-06-01")
            }
        );
        assert_eq!(p.coordinator.active_runs(), vec![RunKey::new("scan:2026-06-01")]);

        // The scheduled fire for the same key counts the day as covered.
        assert!(p.scheduler.tick().await.is_empty());
        assert_eq!(
            p.scheduler.job("scan").unwrap().last_fired(),
            chrono::NaiveDate::from_ymd_opt(2026, 6, 1)
        );

        blocking.release();
        finished(&p, EventKind::RunCompleted).await;
        assert!(p.harness.context.runs.is_empty());

        let third = p.scheduler.trigger_now("scan").await.unwrap();
        assert!(matches!(third, TriggerOutcome::Accepted { .. }));
        let sink = &p.harness.sink;
        tokio::time::timeout(WAIT, async {
            while sink.events_of_kind(EventKind::RunCompleted).len() < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(blocking.started(), 2);
    }

    #[tokio::test]
    async fn test_quota_recovers_in_next_window() {
        let fetch = ScriptedStage::new("Fetch").requires(["primary"]);
        let config = fast_config().with_provider(
            ProviderQuotaConfig::new("primary", 1).with_window(Duration::from_secs(60)),
        );
        let harness = TestHarness::new(config, utc(2026, 6, 1, 12, 0));
        let coordinator = Coordinator::new(&harness.context, vec![fetch.clone().into_arc()]);

        let first = coordinator.run(RunKey::new("r1")).await.unwrap();
        assert_eq!(first.status, RunStatus::Succeeded);

        let second = coordinator.run(RunKey::new("r2")).await.unwrap();
        assert_eq!(second.status, RunStatus::PartiallyFailed);
        assert_eq!(second.stages[0].error_code(), Some("no_provider_available"));

        harness.clock.advance(chrono::Duration::seconds(60));
        let third = coordinator.run(RunKey::new("r3")).await.unwrap();
        assert_eq!(third.status, RunStatus::Succeeded);
        assert_eq!(fetch.call_count(), 2);
    }

    #[tokio::test]
    async fn test_quota_warning_published_once() {
        let fetch = ScriptedStage::new("Fetch").requires(["primary"]);
        let config = fast_config().with_provider(ProviderQuotaConfig::new("primary", 5).with_warn_ratio(0.6));
        let harness = TestHarness::new(config, utc(2026, 6, 1, 12, 0));
        let coordinator = Coordinator::new(&harness.context, vec![fetch.into_arc()]);

        for i in 0..5 {
            coordinator.run(RunKey::new(format!("r{i}"))).await.unwrap();
        }
        assert!(harness.sink.wait_for_kind(EventKind::QuotaWarning, WAIT).await.is_some());
        assert!(harness.sink.wait_for_kind(EventKind::RunCompleted, WAIT).await.is_some());
        assert_eq!(harness.sink.events_of_kind(EventKind::QuotaWarning).len(), 1);
    }

    async fn fires_over_day(scheduler: &Scheduler, from: DateTime<Utc>, minutes: i64) -> Vec<DateTime<Utc>> {
        let mut fired = Vec::new();
        for minute in 0..minutes {
            let now = from + chrono::Duration::minutes(minute);
            if !scheduler.tick_at(now).await.is_empty() {
                fired.push(now);
            }
        }
        fired
    }

    #[tokio::test]
    async fn test_spring_forward_fires_once_after_gap() {
        let p = pipeline(
            &[],
            vec![
                JobConfig::new("night", "02:30", "Europe/Berlin"),
                JobConfig::new("morning", "09:00", "Europe/Berlin"),
            ],
            Vec::new(),
            utc(2026, 3, 28, 23, 0),
        );
        // 23:00 UTC is local midnight; the 23-hour local day skips 02:00 to 03:00.
        let fired = fires_over_day(&p.scheduler, utc(2026, 3, 28, 23, 0), 23 * 60).await;
        assert_eq!(fired, vec![utc(2026, 3, 29, 1, 0), utc(2026, 3, 29, 7, 0)]);
    }

    #[tokio::test]
    async fn test_fall_back_fires_on_first_occurrence_only() {
        let p = pipeline(
            &[],
            vec![JobConfig::new("night", "02:30", "Europe/Berlin")],
            Vec::new(),
            utc(2026, 10, 24, 22, 0),
        );
        // 02:30 local happens at 00:30 UTC (CEST) and again at 01:30 UTC (CET).
        let fired = fires_over_day(&p.scheduler, utc(2026, 10, 24, 22, 0), 25 * 60).await;
        assert_eq!(fired, vec![utc(2026, 10, 25, 0, 30)]);
    }

    #[tokio::test]
    async fn test_system_shutdown_cancels_in_flight_run() {
        let blocking = BlockingStage::new("Fetch");
        let harness = TestHarness::new(
            fast_config().with_job(JobConfig::new("scan", "23:00", "UTC")),
            utc(2026, 6, 1, 7, 0),
        );
        let system = PipelineSystem::with_context(
            harness.context.clone(),
            vec![blocking.clone().into_arc(), ScriptedStage::new("Report").into_arc()],
        )
        .unwrap();
        system.start();

        system.trigger_now("scan").await.unwrap();
        assert!(blocking.wait_started(WAIT).await);

        let report = system.shutdown(true).await;
        assert_eq!(report.aborted_runs, 0);
        assert!(!report.bus.timed_out);

        let failed = harness.sink.events_of_kind(EventKind::RunFailed);
        assert_eq!(failed.len(), 1);
        let done = failed[0].as_run_finished().unwrap();
        assert_eq!(done.reason.as_deref(), Some("cancelled"));
        assert_eq!(statuses(done), vec![("Fetch", StageStatus::Failed)]);
        assert_eq!(done.stages[0].error_code(), Some("cancelled"));
        assert!(matches!(
            system.trigger_now("scan").await,
            Err(crate::errors::ScanflowError::BusShutdown)
        ));
    }
}
