use comms::{
    msg::{Command, Msg, Payload},
    specs::group::JoinSpec,
};
use tokio::io;

const SIZE: usize = 1024;

#[tokio::test]
async fn control_messages_cross_a_duplex_link() {
    let (one, two) = io::duplex(SIZE);
    let (rx, tx) = io::split(one);
    let (_, mut tx) = comms::channel(rx, tx);

    let (rx, tx2) = io::split(two);
    let (mut rx, _tx2) = comms::channel(rx, tx2);

    let join = JoinSpec {
        rank: 3,
        world_size: 4,
    };
    tx.send(&Msg::Control(Command::Join(join))).await.unwrap();
    tx.send(&Msg::Control(Command::Barrier)).await.unwrap();

    let mut buf: Vec<u32> = Vec::new();
    match rx.recv_into(&mut buf).await.unwrap() {
        Msg::Control(Command::Join(got)) => assert_eq!(got, join),
        other => panic!("expected join, got {}", other.kind()),
    }

    match rx.recv_into(&mut buf).await.unwrap() {
        Msg::Control(Command::Barrier) => {}
        other => panic!("expected barrier, got {}", other.kind()),
    }
}

#[tokio::test]
async fn float_payloads_survive_the_link_bit_for_bit() {
    let (one, two) = io::duplex(SIZE);
    let (rx, tx) = io::split(one);
    let (_, mut tx) = comms::channel(rx, tx);

    let (rx, tx2) = io::split(two);
    let (mut rx, _tx2) = comms::channel(rx, tx2);

    let nums: Vec<f32> = (0..500).map(|i| (i as f32).sin() * 1e-3).collect();
    let sender = tokio::spawn(async move {
        tx.send(&Msg::Data(Payload::Contribution(&nums))).await.unwrap();
        nums
    });

    let mut buf: Vec<u32> = Vec::new();
    let got = match rx.recv_into(&mut buf).await.unwrap() {
        Msg::Data(Payload::Contribution(got)) => got.to_vec(),
        other => panic!("expected contribution, got {}", other.kind()),
    };

    let nums = sender.await.unwrap();
    let same = nums
        .iter()
        .zip(&got)
        .all(|(a, b)| a.to_bits() == b.to_bits());
    assert_eq!(got.len(), nums.len());
    assert!(same);
}

#[tokio::test]
async fn error_messages_carry_their_text() {
    let (one, two) = io::duplex(SIZE);
    let (rx, tx) = io::split(one);
    let (_, mut tx) = comms::channel(rx, tx);

    let (rx, tx2) = io::split(two);
    let (mut rx, _tx2) = comms::channel(rx, tx2);

    tx.send(&Msg::Err("length mismatch".into())).await.unwrap();

    let mut buf: Vec<u32> = Vec::new();
    match rx.recv_into(&mut buf).await.unwrap() {
        Msg::Err(text) => assert_eq!(text, "length mismatch"),
        other => panic!("expected err, got {}", other.kind()),
    }
}

#[tokio::test]
async fn a_closed_link_surfaces_as_unexpected_eof() {
    let (one, two) = io::duplex(SIZE);
    drop(one);

    let (rx, tx) = io::split(two);
    let (mut rx, _) = comms::channel(rx, tx);

    let mut buf: Vec<u32> = Vec::new();
    let err = rx.recv_into::<Msg, _>(&mut buf).await.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
}
