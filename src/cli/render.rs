//! Human-readable scheduler snapshots.

use colored::*;

use minerd::SchedulerSnapshot;
use minerd::domain::TaskStatus;

fn ms(value: Option<u64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{}ms", v))
}

/// Render a snapshot as a short multi-line block
pub fn render_snapshot(snapshot: &SchedulerSnapshot) -> String {
    let state = if snapshot.running { "running".green() } else { "stopped".red() };
    let mut out = format!(
        "{} {} cycle {} ({}, since {})\n",
        "minerd".bold(),
        state,
        snapshot.cycle,
        format!("{:?}", snapshot.reset_mode).to_lowercase(),
        snapshot.cycle_started_at.format("%H:%M:%S")
    );

    let counts: Vec<String> = TaskStatus::ALL
        .iter()
        .filter(|s| snapshot.tasks.get(**s) > 0)
        .map(|s| format!("{}={}", s, snapshot.tasks.get(*s)))
        .collect();
    out.push_str(&format!("  tasks     {} [{}]\n", snapshot.tasks.total(), counts.join(" ")));
    out.push_str(&format!(
        "  capacity  open {}/{}  mining {}/{}  opening {}/{}  ready {}\n",
        snapshot.open_pages,
        snapshot.max_open_pages,
        snapshot.active_mining,
        snapshot.max_active_mining,
        snapshot.initializing,
        snapshot.page_open_concurrency,
        snapshot.sessions_ready,
    ));
    out.push_str(&format!(
        "  results   success {}  failed {}  solutions {} ({} this cycle)\n",
        snapshot.success.to_string().green(),
        snapshot.failed.to_string().red(),
        snapshot.submitted_solutions,
        snapshot.submitted_in_cycle,
    ));
    out.push_str(&format!(
        "  latency   login {} ({} samples)  mining {} ({} samples)\n",
        ms(snapshot.avg_login_latency_ms),
        snapshot.login_samples,
        ms(snapshot.avg_mining_latency_ms),
        snapshot.mining_samples,
    ));
    out.push_str(&format!(
        "  pacing    nav {}ms  poll {}ms  submissions {}  throttled {}",
        snapshot.navigation_interval_ms,
        snapshot.poll_interval_ms,
        snapshot.submissions_in_flight,
        snapshot.consecutive_throttled,
    ));
    if let Some(paused) = snapshot.admission_paused_ms {
        out.push_str(&format!("  {}", format!("admission paused {}ms", paused).yellow()));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use minerd::scheduler::ResetMode;

    fn snapshot() -> SchedulerSnapshot {
        SchedulerSnapshot {
            running: true,
            cycle: 4,
            cycle_started_at: chrono::Utc::now(),
            reset_mode: ResetMode::Soft,
            tasks: Default::default(),
            open_pages: 3,
            max_open_pages: 12,
            active_mining: 2,
            max_active_mining: 6,
            initializing: 1,
            page_open_concurrency: 4,
            sessions_ready: 1,
            success: 5,
            failed: 1,
            submitted_solutions: 5,
            submitted_in_cycle: 2,
            avg_login_latency_ms: Some(1200),
            avg_mining_latency_ms: None,
            login_samples: 6,
            mining_samples: 0,
            consecutive_throttled: 0,
            admission_paused_ms: Some(1500),
            navigation_interval_ms: 1000,
            poll_interval_ms: 2000,
            submissions_in_flight: 0,
            inits_in_flight: 1,
        }
    }

    #[test]
    fn test_render_snapshot() {
        colored::control::set_override(false);
        let out = render_snapshot(&snapshot());
        assert!(out.contains("cycle 4 (soft, since "));
        assert!(out.contains("open 3/12"));
        assert!(out.contains("mining 2/6"));
        assert!(out.contains("login 1200ms"));
        assert!(out.contains("mining - (0 samples)"));
        assert!(out.contains("admission paused 1500ms"));
    }
}
