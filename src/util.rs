//! Network-wide constants and small epoch helpers shared across modules.

use std::time::Duration;

/// Average Filecoin block time. Cron ticks and deal-watch polling use this
/// as their base interval.
pub const AVG_BLOCK_TIME: Duration = Duration::from_secs(30);

/// Network-defined lower bound for storage deal duration, in epochs
/// (~180 days at 30s epochs).
pub const MIN_DEAL_DURATION: u64 = 518_400;

/// Lower bound for how far in the future a deal may start, in epochs.
pub const MIN_DEAL_START_OFFSET: u64 = 2 * 2880;

/// One GiB, the unit miner epoch prices are quoted against.
pub const GIB: u64 = 1 << 30;

/// Price per epoch for a deal: the miner quotes attoFIL-per-epoch-per-GiB,
/// so the effective price scales with piece size in GiB.
pub fn deal_epoch_price(epoch_price_per_gib: u64, piece_size: u64) -> u64 {
    ((epoch_price_per_gib as u128 * piece_size as u128) / GIB as u128) as u64
}

/// Effective deal duration honoring the network minimum.
pub fn deal_duration(min_duration: u64) -> u64 {
    min_duration.max(MIN_DEAL_DURATION)
}

/// Epoch at which a new deal should start, bounded below so the proposal
/// isn't rejected for starting too soon.
pub fn deal_start_epoch(chain_head: u64, start_offset: u64) -> u64 {
    chain_head + start_offset.max(MIN_DEAL_START_OFFSET)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_price_scales_with_piece_size() {
        // 1 GiB piece pays the quoted price verbatim.
        assert_eq!(deal_epoch_price(500_000_000, GIB), 500_000_000);
        // Half a GiB pays half.
        assert_eq!(deal_epoch_price(500_000_000, GIB / 2), 250_000_000);
        // Tiny pieces round down, never up.
        assert_eq!(deal_epoch_price(3, 1), 0);
    }

    #[test]
    fn duration_honors_network_minimum() {
        assert_eq!(deal_duration(0), MIN_DEAL_DURATION);
        assert_eq!(deal_duration(MIN_DEAL_DURATION + 10), MIN_DEAL_DURATION + 10);
    }

    #[test]
    fn start_epoch_is_bounded_below() {
        assert_eq!(deal_start_epoch(100, 0), 100 + MIN_DEAL_START_OFFSET);
        assert_eq!(deal_start_epoch(100, MIN_DEAL_START_OFFSET + 5), 100 + MIN_DEAL_START_OFFSET + 5);
    }
}
