use terrace::{Config, FoldRange};
use test_log::test;

const ITEM_COUNT: u64 = 1_000;

fn keys_of(entries: &[(terrace::UserKey, terrace::UserValue)]) -> Vec<u64> {
    entries
        .iter()
        .map(|(key, _)| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(key);
            u64::from_be_bytes(bytes)
        })
        .collect()
}

fn collect(
    store: &terrace::Store,
    range: FoldRange,
) -> terrace::Result<Vec<(terrace::UserKey, terrace::UserValue)>> {
    store.fold_range(range, Vec::new(), |mut acc, key, value| {
        acc.push((key, value));
        Ok(acc)
    })
}

#[test]
fn store_full_range_is_sorted() -> terrace::Result<()> {
    let folder = tempfile::tempdir()?;

    let store = Config::new(folder.path()).open()?;

    // Insert in descending order; the fold must still ascend
    for i in (0..ITEM_COUNT).rev() {
        store.put(i.to_be_bytes(), "v")?;
    }

    let entries = collect(&store, FoldRange::all())?;
    let keys = keys_of(&entries);

    assert_eq!((0..ITEM_COUNT).collect::<Vec<_>>(), keys);

    Ok(())
}

#[test]
fn store_bounded_range() -> terrace::Result<()> {
    let folder = tempfile::tempdir()?;

    let store = Config::new(folder.path()).open()?;

    for i in 0..ITEM_COUNT {
        store.put(i.to_be_bytes(), "v")?;
    }

    let range = FoldRange::all()
        .from_key(100u64.to_be_bytes())
        .to_key(200u64.to_be_bytes());

    let entries = collect(&store, range)?;
    let keys = keys_of(&entries);

    // Half-open: [100, 200)
    assert_eq!((100..200).collect::<Vec<_>>(), keys);

    Ok(())
}

#[test]
fn store_range_with_limit() -> terrace::Result<()> {
    let folder = tempfile::tempdir()?;

    let store = Config::new(folder.path()).open()?;

    for i in 0..ITEM_COUNT {
        store.put(i.to_be_bytes(), "v")?;
    }

    let entries = collect(&store, FoldRange::all().limit(42))?;
    assert_eq!(42, entries.len());

    // A limit below 10 takes the blocking path; results are the same
    let entries = collect(&store, FoldRange::all().from_key(500u64.to_be_bytes()).limit(5))?;
    let keys = keys_of(&entries);
    assert_eq!(vec![500, 501, 502, 503, 504], keys);

    Ok(())
}

#[test]
fn store_range_limit_zero() -> terrace::Result<()> {
    let folder = tempfile::tempdir()?;

    let store = Config::new(folder.path()).open()?;
    store.put("a", "1")?;

    let entries = collect(&store, FoldRange::all().limit(0))?;
    assert!(entries.is_empty());

    Ok(())
}

#[test]
fn store_inverted_range_is_rejected() -> terrace::Result<()> {
    let folder = tempfile::tempdir()?;

    let store = Config::new(folder.path()).open()?;

    let result = collect(&store, FoldRange::all().from_key("b").to_key("a"));
    assert!(matches!(result, Err(terrace::Error::InvalidArgument(_))));

    Ok(())
}

#[test]
fn store_snapshot_fold_ignores_later_writes() -> terrace::Result<()> {
    let folder = tempfile::tempdir()?;

    let store = Config::new(folder.path()).open()?;

    for i in 0u64..100 {
        store.put(i.to_be_bytes(), "old")?;
    }

    // The fold pins its view up front; writes issued while the fold is
    // being consumed must not leak into it
    let writer = store.clone();
    let entries = store.fold_range(FoldRange::all(), Vec::new(), move |mut acc, key, value| {
        writer.put(1_000_000u64.to_be_bytes(), "late")?;
        acc.push((key, value));
        Ok(acc)
    })?;

    assert_eq!(100, entries.len());
    assert!(entries.iter().all(|(_, value)| &**value == b"old"));

    Ok(())
}

#[test]
fn store_fold_user_error_is_returned() -> terrace::Result<()> {
    let folder = tempfile::tempdir()?;

    let store = Config::new(folder.path()).open()?;

    for i in 0u64..100 {
        store.put(i.to_be_bytes(), "v")?;
    }

    let result = store.fold(0u64, |acc, _, _| {
        if acc == 10 {
            Err(terrace::Error::InvalidArgument("user says no"))
        } else {
            Ok(acc + 1)
        }
    });

    assert!(matches!(
        result,
        Err(terrace::Error::InvalidArgument("user says no"))
    ));

    // The store keeps working after the aborted fold
    assert_eq!(Some("v".as_bytes().into()), store.get(0u64.to_be_bytes())?);
    let count = store.fold(0u64, |acc, _, _| Ok(acc + 1))?;
    assert_eq!(100, count);

    Ok(())
}
