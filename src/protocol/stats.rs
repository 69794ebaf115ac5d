use serde::Deserialize;

/// Node statistics pushed over `stats` frames, consumed by the registry's
/// load balancer.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStats {
    pub players: u32,
    pub playing_players: u32,
    /// Node uptime in milliseconds.
    pub uptime: u64,
    pub memory: MemoryStats,
    pub cpu: CpuStats,
    #[serde(default)]
    pub frame_stats: Option<FrameStats>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    pub free: u64,
    pub used: u64,
    pub allocated: u64,
    pub reservable: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuStats {
    pub cores: u32,
    pub system_load: f64,
    pub lavalink_load: f64,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameStats {
    /// Frames sent over the last minute.
    pub sent: i64,
    /// Frames that were nulled (silence substituted).
    pub nulled: i64,
    /// Difference between expected and actually sent frames.
    pub deficit: i64,
}

impl NodeStats {
    /// Load-balancing penalty, lower is better.
    ///
    /// Weighting follows the standard Lavalink client formula: playing player
    /// count, an exponential CPU penalty, and frame deficit/null penalties
    /// when frame stats are reported.
    pub fn penalty(&self) -> u64 {
        let player_penalty = self.playing_players as f64;
        let cpu_penalty = 1.05f64.powf(100.0 * self.cpu.system_load) * 10.0 - 10.0;

        let mut frame_penalty = 0.0;
        if let Some(frames) = &self.frame_stats {
            let deficit = frames.deficit.max(0) as f64;
            let nulled = frames.nulled.max(0) as f64;
            frame_penalty += 1.03f64.powf(500.0 * (deficit / 3000.0)) * 600.0 - 600.0;
            frame_penalty += (1.03f64.powf(500.0 * (nulled / 3000.0)) * 600.0 - 600.0) * 2.0;
        }

        (player_penalty + cpu_penalty + frame_penalty).round().max(0.0) as u64
    }
}
