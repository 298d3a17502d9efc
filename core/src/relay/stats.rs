// Session statistics — what the relay has moved and how fast rounds close

/// Counters kept by the relay across a session. Snapshot with `clone()`.
#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    /// Upstream cells decoded.
    pub upstream_cells: u64,
    /// Upstream payload bytes delivered.
    pub upstream_bytes: u64,
    /// Downstream cells sent over the reliable path.
    pub downstream_cells: u64,
    /// Downstream cells sent over the broadcast path.
    pub downstream_udp_cells: u64,
    /// Downstream payload bytes sent.
    pub downstream_bytes: u64,
    /// Rate-change messages sent to trustees.
    pub rate_changes_sent: u64,
    /// Rounds closed normally.
    pub rounds_closed: u64,
    /// Rounds skipped by timeout.
    pub rounds_skipped: u64,
    /// Owner cells whose disruption MAC did not verify.
    pub disrupted_cells: u64,
    /// Total time spent in closed rounds, in milliseconds.
    pub total_round_time_ms: u64,
}

impl SessionStats {
    pub fn add_upstream_cell(&mut self, bytes: usize) {
        self.upstream_cells += 1;
        self.upstream_bytes += bytes as u64;
    }

    pub fn add_downstream_cell(&mut self, bytes: usize, udp: bool) {
        if udp {
            self.downstream_udp_cells += 1;
        } else {
            self.downstream_cells += 1;
        }
        self.downstream_bytes += bytes as u64;
    }

    pub fn add_closed_round(&mut self, duration_ms: u64) {
        self.rounds_closed += 1;
        self.total_round_time_ms += duration_ms;
    }

    /// Mean round duration in milliseconds, 0 before the first close.
    pub fn mean_round_time_ms(&self) -> u64 {
        if self.rounds_closed == 0 {
            0
        } else {
            self.total_round_time_ms / self.rounds_closed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let mut stats = SessionStats::default();
        stats.add_upstream_cell(100);
        stats.add_upstream_cell(100);
        stats.add_downstream_cell(64, false);
        stats.add_downstream_cell(64, true);

        assert_eq!(stats.upstream_cells, 2);
        assert_eq!(stats.upstream_bytes, 200);
        assert_eq!(stats.downstream_cells, 1);
        assert_eq!(stats.downstream_udp_cells, 1);
        assert_eq!(stats.downstream_bytes, 128);
    }

    #[test]
    fn mean_round_time_handles_zero_rounds() {
        let mut stats = SessionStats::default();
        assert_eq!(stats.mean_round_time_ms(), 0);
        stats.add_closed_round(10);
        stats.add_closed_round(20);
        assert_eq!(stats.mean_round_time_ms(), 15);
    }
}
