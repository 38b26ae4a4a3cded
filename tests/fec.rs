use quicveil::fec::{FecConfig, Shard, XorFec};
use std::collections::VecDeque;

fn cfg(data_shards: usize) -> FecConfig {
    FecConfig {
        data_shards,
        min_data_shards: 2,
        max_data_shards: 32,
        ..FecConfig::default()
    }
}

fn send_payloads(fec: &mut XorFec, payloads: &[Vec<u8>]) -> Vec<Shard> {
    let mut out = VecDeque::new();
    for p in payloads {
        fec.on_send(p, &mut out);
    }
    out.into_iter().collect()
}

#[test]
fn lossless_group_delivers_in_order() {
    let mut sender = XorFec::new(cfg(4));
    let payloads: Vec<Vec<u8>> = (0u8..4).map(|i| vec![i; 32]).collect();
    let shards = send_payloads(&mut sender, &payloads);
    assert_eq!(shards.len(), 5);

    let mut receiver = XorFec::new(cfg(4));
    let mut delivered = Vec::new();
    for shard in shards {
        delivered.extend(receiver.on_receive(shard));
    }
    assert_eq!(delivered, payloads);
}

#[test]
fn any_single_loss_is_recovered() {
    // Drop each position in turn, parity included.
    for dropped in 0..5 {
        let mut sender = XorFec::new(cfg(4));
        let payloads: Vec<Vec<u8>> = (0u8..4)
            .map(|i| vec![i.wrapping_mul(17); 24 + i as usize])
            .collect();
        let shards = send_payloads(&mut sender, &payloads);

        let mut receiver = XorFec::new(cfg(4));
        let mut delivered = Vec::new();
        for (i, shard) in shards.into_iter().enumerate() {
            if i == dropped {
                continue;
            }
            delivered.extend(receiver.on_receive(shard));
        }

        if dropped == 4 {
            // Parity lost: all four sources still arrive.
            assert_eq!(delivered.len(), 4);
        } else {
            assert_eq!(delivered.len(), 4, "drop position {}", dropped);
            assert!(delivered.contains(&payloads[dropped]));
        }
    }
}

#[test]
fn recovery_spans_multiple_groups() {
    let mut sender = XorFec::new(cfg(3));
    let payloads: Vec<Vec<u8>> = (0u8..9).map(|i| vec![i; 40]).collect();
    let shards = send_payloads(&mut sender, &payloads);
    // Three groups of 3 + parity each.
    assert_eq!(shards.len(), 12);

    let mut receiver = XorFec::new(cfg(3));
    let mut delivered = Vec::new();
    for (i, shard) in shards.into_iter().enumerate() {
        // Drop one source shard in each group.
        if i % 4 == 1 {
            continue;
        }
        delivered.extend(receiver.on_receive(shard));
    }
    assert_eq!(delivered.len(), 9);
    for p in &payloads {
        assert!(delivered.contains(p));
    }
}

#[test]
fn shards_survive_wire_framing() {
    let mut sender = XorFec::new(cfg(2));
    let payloads = vec![vec![0xAA; 100], vec![0xBB; 64]];
    let shards = send_payloads(&mut sender, &payloads);

    let mut receiver = XorFec::new(cfg(2));
    let mut delivered = Vec::new();
    for shard in shards {
        let wire = shard.to_wire();
        let parsed = Shard::from_wire(&wire).unwrap();
        delivered.extend(receiver.on_receive(parsed));
    }
    assert_eq!(delivered, payloads);
}

#[test]
fn duplicate_shards_deliver_once_per_group_lifetime() {
    let mut sender = XorFec::new(cfg(3));
    let payloads: Vec<Vec<u8>> = (0u8..2).map(|i| vec![i + 1; 16]).collect();
    let shards = send_payloads(&mut sender, &payloads);
    // Group still open (2 of 3 sources sent, no parity yet).
    assert_eq!(shards.len(), 2);

    let mut receiver = XorFec::new(cfg(3));
    let mut delivered = Vec::new();
    for shard in &shards {
        delivered.extend(receiver.on_receive(shard.clone()));
    }
    // Replays of an open group are ignored.
    for shard in &shards {
        delivered.extend(receiver.on_receive(shard.clone()));
    }
    assert_eq!(delivered.len(), 2);
}

#[test]
fn corrupted_frames_are_rejected() {
    assert!(Shard::from_wire(&[]).is_err());
    assert!(Shard::from_wire(&[1, 2, 3]).is_err());

    let shard = Shard {
        group: 1,
        index: 0,
        is_parity: false,
        shard_count: 4,
        data: vec![1, 2, 3],
    };
    let mut wire = shard.to_wire();
    // Truncate the payload below the announced length.
    wire.truncate(wire.len() - 1);
    assert!(Shard::from_wire(&wire).is_err());
}
