use crate::bitcoin::{d::BlockStats, BlockChainTip};

use miniscript::bitcoin;

/// Truncate the sync progress, rounding it up if it gets above 0.999. Note this also caps the
/// progress to 1.0, as bitcoind could temporarily return value >1.0 in getblockchaininfo's
/// "verificationprogress" field.
/// Bitcoind uses a guess for the value of verificationprogress. It will eventually get to
/// be 1, and we want to be less conservative.
pub fn roundup_progress(progress: f64) -> f64 {
    let precision = 10u64.pow(5) as f64;
    let progress_rounded = (progress * precision + 1.0) as u64;

    if progress_rounded >= precision as u64 {
        1.0
    } else {
        (progress * precision) as u64 as f64 / precision
    }
}

// As a standalone function to unit test it.
/// Get the last block of the chain before the given date by performing a binary search.
pub fn block_before_date<Fh, Fs>(
    target_timestamp: u32,
    chain_tip: BlockChainTip,
    mut get_hash: Fh,
    mut get_stats: Fs,
) -> Option<BlockChainTip>
where
    Fh: FnMut(i32) -> Option<bitcoin::BlockHash>,
    Fs: FnMut(bitcoin::BlockHash) -> BlockStats,
{
    log::debug!("Looking for the first block before {}", target_timestamp);

    let mut start_height = 0;
    let mut end_height = chain_tip.height;

    let genesis_stats = get_stats(get_hash(0).expect("Genesis hash"));
    let tip_stats = get_stats(chain_tip.hash);
    if !(genesis_stats.time..tip_stats.time).contains(&target_timestamp) {
        return None;
    }

    while start_height < end_height {
        log::debug!("Start: {}, end: {}", start_height, end_height,);
        let delta = end_height.checked_sub(start_height).unwrap();
        let current_height = start_height + delta.checked_div(2).unwrap();
        // We want the last block with a timestamp below, not the first with a higher one.
        let next_height = current_height.checked_add(1).unwrap();
        let next_stats = get_stats(get_hash(next_height)?);
        log::debug!("Current next block: {:?}", next_stats);

        if target_timestamp > next_stats.time {
            start_height = next_height;
        } else {
            assert!(current_height < end_height);
            end_height = current_height;
        }
    }

    // TODO: the timestamps in the chain are not strictly ordered. There could technically be a
    // timestamp above the target a bit down this height. I think we would be safe by scanning the
    // last 12 blocks and checking their timestamp is below the target. Would we?
    log::debug!("Result height: {}", start_height);
    Some(BlockChainTip {
        height: start_height,
        hash: get_hash(start_height)?,
    })
}
