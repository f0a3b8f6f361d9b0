//! AUM-weighted growth index across one client's pools.

use crate::math::{MathError, Wad};
use crate::model::Pool;
use crate::store::{Ledger, StoreError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientIndexError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Math(#[from] MathError),
}

/// `Σ(aum × index) / Σ aum` over the client's pools, where `aum = staked + pending`.
/// 1.0 when the client holds nothing.
pub fn client_growth_index<L: Ledger>(ledger: &L, client_id: &str) -> Result<Wad, ClientIndexError> {
    let pools: Vec<Pool> = ledger
        .list_pools()?
        .into_iter()
        .filter(|p| p.key.client_id == client_id)
        .collect();
    Ok(aum_weighted_index(&pools)?)
}

fn aum_weighted_index(pools: &[Pool]) -> Result<Wad, MathError> {
    let mut weighted = Vec::with_capacity(pools.len());
    for pool in pools {
        let aum = pool.aum()?;
        if !aum.is_zero() {
            weighted.push((aum, pool.current_index));
        }
    }
    if weighted.is_empty() {
        return Ok(Wad::ONE);
    }
    Wad::weighted_average(weighted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PoolKey;
    use crate::store::MemoryLedger;
    use time::OffsetDateTime;

    fn wad(s: &str) -> Wad {
        s.parse().unwrap()
    }

    fn pool(client: &str, token: &str, staked: &str, pending: &str, index: &str) -> Pool {
        let mut p = Pool::new(
            PoolKey::new(client, "base", token),
            vec![],
            OffsetDateTime::UNIX_EPOCH,
        );
        p.total_staked_balance = wad(staked);
        p.pending_deposit_balance = wad(pending);
        p.current_index = wad(index);
        p
    }

    #[test]
    fn weights_by_aum() {
        let pools = [
            pool("c", "usdc", "600", "0", "1.1"),
            pool("c", "usdt", "300", "100", "1.2"),
        ];
        // (600*1.1 + 400*1.2) / 1000
        assert_eq!(aum_weighted_index(&pools).unwrap(), wad("1.14"));
    }

    #[test]
    fn rounds_once_across_pools() {
        // Equal weights over 1, 2 and 3 units: exact mean is 2 units. Folding
        // pairwise floors 1.5 to 1 first and ends at 1.
        let pools = [
            pool("c", "a", "1", "0", "0.000000000000000001"),
            pool("c", "b", "1", "0", "0.000000000000000002"),
            pool("c", "c", "1", "0", "0.000000000000000003"),
        ];
        assert_eq!(aum_weighted_index(&pools).unwrap(), wad("0.000000000000000002"));
    }

    #[test]
    fn no_aum_is_one() {
        assert_eq!(aum_weighted_index(&[]).unwrap(), Wad::ONE);
        let idle = [pool("c", "usdc", "0", "0", "1.3")];
        assert_eq!(aum_weighted_index(&idle).unwrap(), Wad::ONE);
    }

    #[test]
    fn scoped_to_client() {
        let ledger = MemoryLedger::new();
        ledger
            .transaction(|tx| {
                tx.insert_pool(&pool("a", "usdc", "100", "0", "1.5"))?;
                tx.insert_pool(&pool("b", "usdc", "100", "0", "1.1"))
            })
            .unwrap();
        assert_eq!(client_growth_index(&ledger, "a").unwrap(), wad("1.5"));
        assert_eq!(client_growth_index(&ledger, "nobody").unwrap(), Wad::ONE);
    }
}
