use terrace::Config;
use test_log::test;

#[test]
fn store_expired_entry_is_gone() -> terrace::Result<()> {
    let folder = tempfile::tempdir()?;

    let store = Config::new(folder.path()).open()?;

    store.put("a", "1")?;
    store.put_expiring("a", "2", 1)?;

    std::thread::sleep(std::time::Duration::from_secs(2));

    // The newest version expired; it must not resurrect the older one
    assert_eq!(None, store.get("a")?);

    let keys = store.fold(Vec::new(), |mut acc, key, _| {
        acc.push(key);
        Ok(acc)
    })?;
    assert!(keys.is_empty());

    Ok(())
}

#[test]
fn store_unexpired_entry_is_visible() -> terrace::Result<()> {
    let folder = tempfile::tempdir()?;

    let store = Config::new(folder.path()).open()?;

    store.put_expiring("a", "1", 3_600)?;

    assert_eq!(Some("1".as_bytes().into()), store.get("a")?);

    let count = store.fold(0, |acc, _, _| Ok(acc + 1))?;
    assert_eq!(1, count);

    Ok(())
}

#[test]
fn store_default_expiry_config() -> terrace::Result<()> {
    let folder = tempfile::tempdir()?;

    let store = Config::new(folder.path()).expiry_secs(1).open()?;

    store.put("dies", "1")?;
    store.put_expiring("lives", "2", 3_600)?;

    assert_eq!(Some("1".as_bytes().into()), store.get("dies")?);

    std::thread::sleep(std::time::Duration::from_secs(2));

    assert_eq!(None, store.get("dies")?);
    assert_eq!(Some("2".as_bytes().into()), store.get("lives")?);

    Ok(())
}

#[test]
fn store_expiry_survives_flush() -> terrace::Result<()> {
    let folder = tempfile::tempdir()?;

    let store = Config::new(folder.path()).open()?;

    store.put_expiring("short", "1", 1)?;
    store.put("keeper", "2")?;

    // Push both into the levels
    for i in 0u64..300 {
        store.put(i.to_be_bytes(), "filler")?;
    }

    std::thread::sleep(std::time::Duration::from_secs(2));

    assert_eq!(None, store.get("short")?);
    assert_eq!(Some("2".as_bytes().into()), store.get("keeper")?);

    Ok(())
}
