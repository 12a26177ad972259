#![allow(missing_docs)]
#![forbid(unsafe_code)]

use bytes::Buf;
use proptest::prelude::*;

use kindle::mvcc::{
    decode_message, encode_message, DirectMessage, DirectReader, DirectWriter, MvccSnapshot,
    MvccVersion, MvccVersionAware, MvccVersionMutable, RowVersion, TxState,
};
use kindle::types::{KindleError, Result};

#[test]
fn versions_order_by_coordinator_then_counter() {
    let a = MvccVersion::new(1, 5, 0);
    let b = MvccVersion::new(1, 7, 0);
    let c = MvccVersion::new(2, 1, 0);
    assert!(a < b);
    assert!(b < c);
    assert_eq!(MvccVersion::new(1, 5, 0), MvccVersion::new(1, 5, 9));
}

#[test]
fn wire_reads_counter_first() -> Result<()> {
    let bytes = encode_message(&MvccVersion::new(10, 20, 3));
    let mut body = &bytes[3..];
    assert_eq!(body.get_u64(), 20);
    assert_eq!(body.get_u64(), 10);
    assert_eq!(body.get_i32(), 3);
    assert!(!body.has_remaining());

    let back: MvccVersion = decode_message(&bytes)?;
    assert_eq!(
        (back.coordinator_version(), back.counter(), back.operation_counter()),
        (10, 20, 3)
    );
    Ok(())
}

#[test]
fn wrong_field_count_is_rejected() {
    let mut bytes = encode_message(&MvccVersion::new(1, 1, 1));
    bytes[2] = 4;
    assert!(matches!(
        decode_message::<MvccVersion>(&bytes),
        Err(KindleError::Corruption(_))
    ));
}

#[test]
fn read_only_versions_refuse_mutation_at_runtime() {
    let mut stamps: Vec<Box<dyn MvccVersionAware>> = vec![
        Box::new(MvccVersion::new(1, 2, 3)),
        Box::new(RowVersion {
            version: MvccVersion::new(1, 2, 3),
            tx_state: TxState::Committed,
        }),
    ];
    let results: Vec<bool> = stamps
        .iter_mut()
        .map(|stamp| stamp.try_set_mvcc_version(4, 5, 6).is_ok())
        .collect();
    assert_eq!(results, vec![false, true]);
    assert_eq!(stamps[0].counter(), 2);
    assert_eq!(stamps[1].counter(), 5);
    assert_eq!(stamps[1].tx_state(), TxState::Committed);
}

#[test]
fn snapshot_sees_committed_history_only() {
    let snapshot = MvccSnapshot::new(MvccVersion::new(2, 50, 1), 45).with_active([48]);
    let mut row = RowVersion::default();
    row.set_mvcc_version(2, 47, 0);
    assert!(snapshot.is_visible(&row));
    row.set_mvcc_version_from(&MvccVersion::new(2, 48, 0));
    assert!(!snapshot.is_visible(&row));
    row.set_mvcc_version(2, 50, 0);
    assert!(snapshot.is_visible(&row));
    row.set_mvcc_version(2, 50, 1);
    assert!(!snapshot.is_visible(&row));
}

fn version() -> impl Strategy<Value = MvccVersion> {
    (any::<u64>(), any::<u64>(), any::<u32>())
        .prop_map(|(crd, cntr, op)| MvccVersion::new(crd, cntr, op))
}

proptest! {
    #[test]
    fn ordering_ignores_operation_counter(a in version(), b in version(), op in any::<u32>()) {
        let expected = (a.coordinator_version(), a.counter())
            .cmp(&(b.coordinator_version(), b.counter()));
        prop_assert_eq!(a.cmp(&b), expected);
        prop_assert_eq!(a.with_operation_counter(op), a);
    }

    #[test]
    fn reads_and_writes_resume_across_any_chunking(
        v in version(),
        write_chunk in 1usize..8,
        cuts in prop::collection::vec(1usize..23, 0..6),
    ) {
        let mut writer = DirectWriter::new();
        let mut wire = Vec::new();
        loop {
            let mut buf = vec![0u8; write_chunk];
            let mut window = buf.as_mut_slice();
            let done = v.write_to(&mut window, &mut writer);
            let used = write_chunk - window.len();
            wire.extend_from_slice(&buf[..used]);
            if done {
                break;
            }
        }
        prop_assert_eq!(wire.len(), 23);

        let mut cuts = cuts;
        cuts.push(0);
        cuts.push(wire.len());
        cuts.sort_unstable();
        cuts.dedup();
        let mut reader = DirectReader::new();
        let mut decoded = MvccVersion::default();
        let mut done = false;
        for pair in cuts.windows(2) {
            let mut chunk = &wire[pair[0]..pair[1]];
            done = decoded.read_from(&mut chunk, &mut reader).expect("read");
            prop_assert!(!chunk.has_remaining() || done);
        }
        prop_assert!(done);
        prop_assert_eq!(decoded.coordinator_version(), v.coordinator_version());
        prop_assert_eq!(decoded.counter(), v.counter());
        prop_assert_eq!(decoded.operation_counter(), v.operation_counter());
    }
}
