use super::*;

#[test]
fn offset_next_and_distance() {
    let a = LogOffset::new(5);
    let b = LogOffset::new(10);

    assert_eq!(a.next(), LogOffset::new(6));
    assert_eq!(a.distance_to(b), 5);
    assert_eq!(b.distance_to(a), 0); // saturating
}

#[test]
fn offset_arithmetic() {
    let mut off = LogOffset::ZERO;
    off += 3;
    assert_eq!(off, LogOffset::new(3));
    assert_eq!(off + 2, LogOffset::new(5));
}

#[test]
fn offset_ordering() {
    assert!(LogOffset::new(1) < LogOffset::new(2));
    assert_eq!(LogOffset::ZERO.as_u64(), 0);
}

#[test]
fn offset_display() {
    assert_eq!(format!("{}", LogOffset::new(42)), "42");
}

#[test]
fn term_next_and_display() {
    let t = Term::new(7);
    assert_eq!(t.next(), Term::new(8));
    assert_eq!(format!("{t}"), "t7");
}

#[test]
fn term_ordering_detects_stale() {
    let current = Term::new(3);
    let stale = Term::new(2);
    assert!(stale < current);
}

#[test]
fn timestamp_roundtrip() {
    let ts = Timestamp::new(9527);
    assert_eq!(ts.as_i64(), 9527);
    assert_eq!(i64::from(ts), 9527);
    assert_eq!(Timestamp::from(9527), ts);
}
