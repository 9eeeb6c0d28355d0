//! XOR distance metric over the 128-bit node ID key space.
//!
//! Kademlia organizes peers by the XOR of their 128-bit IDs. Bucket `i`
//! holds peers at distance `[2^i, 2^(i+1))` from the local node.

use crate::identity::{NodeId, NODE_ID_BITS};
use rand::Rng;

/// XOR distance between two node IDs. Symmetric; zero iff the IDs are equal.
pub fn distance(a: &NodeId, b: &NodeId) -> u128 {
    a.value() ^ b.value()
}

/// K-bucket index for a non-zero distance: `floor(log2(d))`, clamped to 127.
///
/// Zero distance has no bucket (a node never routes to itself); callers must
/// reject it before asking for an index.
pub fn bucket_index(d: u128) -> Option<usize> {
    if d == 0 {
        return None;
    }
    let index = (127 - d.leading_zeros()) as usize;
    Some(index.min(NODE_ID_BITS as usize - 1))
}

/// Sort node IDs by ascending XOR distance to `target`.
pub fn sort_by_distance(target: &NodeId, ids: &mut [NodeId]) {
    ids.sort_by_key(|id| distance(target, id));
}

/// Whether `candidate` is strictly closer to `target` than `reference`.
pub fn is_closer(target: &NodeId, candidate: &NodeId, reference: &NodeId) -> bool {
    distance(target, candidate) < distance(target, reference)
}

/// Random node ID whose distance from `reference` lies in
/// `[2^bucket, 2^(bucket+1))`. Used for bucket refresh lookups.
pub fn random_id_in_bucket(reference: &NodeId, bucket: usize) -> NodeId {
    let bucket = bucket.min(NODE_ID_BITS as usize - 1);
    let low = 1u128 << bucket;
    let span: u128 = if bucket == 0 { 0 } else { low - 1 };

    let mut rng = rand::thread_rng();
    let offset: u128 = if span == 0 { 0 } else { rng.gen_range(0..=span) };

    NodeId::from_value(reference.value() ^ (low | offset))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(v: u128) -> NodeId {
        NodeId::from_value(v)
    }

    #[test]
    fn test_distance_symmetric_and_zero() {
        let a = id(0xabcd);
        let b = id(0x1234);
        assert_eq!(distance(&a, &b), distance(&b, &a));
        assert_eq!(distance(&a, &a), 0);
        assert_eq!(distance(&a, &b), 0xabcd ^ 0x1234);
    }

    #[test]
    fn test_bucket_index() {
        assert_eq!(bucket_index(0), None);
        assert_eq!(bucket_index(1), Some(0));
        assert_eq!(bucket_index(5), Some(2));
        assert_eq!(bucket_index(256), Some(8));
        assert_eq!(bucket_index(u128::MAX), Some(127));
    }

    #[test]
    fn test_bucket_index_in_range_for_random_pairs() {
        for _ in 0..100 {
            let a = NodeId::random();
            let b = NodeId::random();
            if a == b {
                continue;
            }
            let idx = bucket_index(distance(&a, &b)).unwrap();
            assert!(idx <= 127);
        }
    }

    #[test]
    fn test_sort_by_distance() {
        let target = id(0);
        let mut ids = vec![id(3), id(1), id(7), id(2)];
        sort_by_distance(&target, &mut ids);
        assert_eq!(ids, vec![id(1), id(2), id(3), id(7)]);
    }

    #[test]
    fn test_closer_sorts_first() {
        let c = NodeId::random();
        let a = id(c.value() ^ 1);
        let b = id(c.value() ^ 0xffff);
        assert!(is_closer(&c, &a, &b));
        let mut ids = vec![b.clone(), a.clone()];
        sort_by_distance(&c, &mut ids);
        assert_eq!(ids[0], a);
    }

    #[test]
    fn test_random_id_in_bucket_range() {
        let reference = NodeId::random();
        for bucket in [0usize, 1, 5, 64, 127] {
            let rid = random_id_in_bucket(&reference, bucket);
            let d = distance(&reference, &rid);
            assert!(d >= 1u128 << bucket);
            if bucket < 127 {
                assert!(d < 1u128 << (bucket + 1));
            }
            assert_eq!(bucket_index(d), Some(bucket));
        }
    }
}
