// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use tl_core::TagKind;

fn accepted() -> Accepted {
    Accepted {
        ballot: 3 << 8 | 1,
        tag: Tag::wal(TagKind::WalData),
        value: Bytes::from_static(b"value"),
    }
}

#[test]
fn promise_carries_the_accepted_value() {
    let msg = PaxosMsg::Promise {
        scn: 12,
        ballot: 4 << 8,
        accepted: Some(accepted()),
    };
    assert_eq!(PaxosMsg::decode(msg.encode()).unwrap(), msg);

    let empty = PaxosMsg::Promise {
        scn: 12,
        ballot: 4 << 8,
        accepted: None,
    };
    assert!(empty.encode().len() < msg.encode().len());
    assert_eq!(PaxosMsg::decode(empty.encode()).unwrap(), empty);
}

#[test]
fn history_keeps_entry_order() {
    let entries: Vec<Decided> = (5..8)
        .map(|scn| Decided {
            scn,
            tag: Tag::wal(TagKind::WalData),
            value: Bytes::from(format!("v{scn}")),
        })
        .collect();
    let msg = PaxosMsg::History(entries.clone());
    match PaxosMsg::decode(msg.encode()).unwrap() {
        PaxosMsg::History(decoded) => assert_eq!(decoded, entries),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn malformed_frames_are_rejected() {
    assert!(PaxosMsg::decode(Bytes::from_static(&[99])).is_err());
    assert!(PaxosMsg::decode(Bytes::new()).unwrap_err().is_truncation());

    let mut frame = PaxosMsg::Ack { scn: 1 }.encode().to_vec();
    frame.push(0);
    assert!(matches!(
        PaxosMsg::decode(Bytes::from(frame)),
        Err(FormatError::BadPayload(_))
    ));

    let accept = PaxosMsg::Accept {
        scn: 1,
        ballot: 1,
        tag: Tag::wal(TagKind::WalData),
        value: Bytes::from_static(b"abc"),
    }
    .encode();
    let cut = accept.slice(..accept.len() - 2);
    assert!(PaxosMsg::decode(cut).unwrap_err().is_truncation());
}

#[test]
fn persisted_rows_decode() {
    assert_eq!(decode_promise_row(promise_row_data(77)).unwrap(), 77);
    assert_eq!(decode_accept_row(accept_row_data(&accepted())).unwrap(), accepted());
    assert!(decode_promise_row(Bytes::from_static(b"short")).is_err());
}
