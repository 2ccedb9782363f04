use terrace::Config;
use test_log::test;

// Writing this many entries forces at least one nursery flush
// (the top level holds up to 2^8 = 256 entries)
const FLUSH_COUNT: u64 = 300;

#[test]
fn store_put_put_delete_put() -> terrace::Result<()> {
    let folder = tempfile::tempdir()?;

    let store = Config::new(folder.path()).open()?;

    store.put("k", "v1")?;
    store.put("k", "v2")?;
    store.delete("k")?;
    assert_eq!(None, store.get("k")?);

    store.put("k", "v3")?;
    assert_eq!(Some("v3".as_bytes().into()), store.get("k")?);

    Ok(())
}

#[test]
fn store_shadowing_across_flushes() -> terrace::Result<()> {
    let folder = tempfile::tempdir()?;

    let store = Config::new(folder.path()).open()?;

    let key = "shadowed".as_bytes();

    store.put(key, "old")?;

    // Push the old version into the levels
    for i in 0..FLUSH_COUNT {
        store.put(i.to_be_bytes(), "filler")?;
    }
    assert_eq!(Some("old".as_bytes().into()), store.get(key)?);

    store.put(key, "new")?;
    assert_eq!(Some("new".as_bytes().into()), store.get(key)?);

    // And push the new version down as well
    for i in 0..FLUSH_COUNT {
        store.put(i.to_be_bytes(), "filler")?;
    }
    assert_eq!(Some("new".as_bytes().into()), store.get(key)?);

    Ok(())
}

#[test]
fn store_tombstone_shadows_levels() -> terrace::Result<()> {
    let folder = tempfile::tempdir()?;

    let store = Config::new(folder.path()).open()?;

    let key = "doomed".as_bytes();

    store.put(key, "value")?;

    for i in 0..FLUSH_COUNT {
        store.put(i.to_be_bytes(), "filler")?;
    }
    assert_eq!(Some("value".as_bytes().into()), store.get(key)?);

    store.delete(key)?;
    assert_eq!(None, store.get(key)?);

    // The tombstone must keep shadowing after it is flushed down too
    for i in 0..FLUSH_COUNT {
        store.put(i.to_be_bytes(), "filler")?;
    }
    assert_eq!(None, store.get(key)?);

    let live = store.fold(Vec::new(), |mut acc, key, _| {
        acc.push(key);
        Ok(acc)
    })?;
    assert!(!live.iter().any(|k| &**k == b"doomed"));

    Ok(())
}
