use terrace::Config;
use test_log::test;

#[test]
fn store_write_and_read() -> terrace::Result<()> {
    let folder = tempfile::tempdir()?;

    let store = Config::new(folder.path()).open()?;

    store.put("a", "1")?;
    store.put("b", "2")?;

    assert_eq!(Some("1".as_bytes().into()), store.get("a")?);
    assert_eq!(Some("2".as_bytes().into()), store.get("b")?);
    assert_eq!(None, store.get("c")?);

    assert!(store.contains_key("a")?);
    assert!(!store.contains_key("c")?);

    Ok(())
}

#[test]
fn store_read_after_reopen() -> terrace::Result<()> {
    let folder = tempfile::tempdir()?;

    {
        let store = Config::new(folder.path()).open()?;
        store.put("a", "1")?;
        store.put("b", "2")?;
        store.close()?;
    }

    let store = Config::new(folder.path()).open()?;

    assert_eq!(Some("1".as_bytes().into()), store.get("a")?);
    assert_eq!(Some("2".as_bytes().into()), store.get("b")?);
    assert_eq!(None, store.get("c")?);

    Ok(())
}

#[test]
fn store_close_is_idempotent() -> terrace::Result<()> {
    let folder = tempfile::tempdir()?;

    let store = Config::new(folder.path()).open()?;
    store.put("a", "1")?;

    store.close()?;
    store.close()?;

    Ok(())
}

#[test]
fn store_rejects_empty_key() -> terrace::Result<()> {
    let folder = tempfile::tempdir()?;

    let store = Config::new(folder.path()).open()?;

    assert!(matches!(
        store.put("", "1"),
        Err(terrace::Error::InvalidArgument(_))
    ));
    assert!(matches!(
        store.get(""),
        Err(terrace::Error::InvalidArgument(_))
    ));
    assert!(matches!(
        store.delete(""),
        Err(terrace::Error::InvalidArgument(_))
    ));

    Ok(())
}

#[test]
fn store_overwrite_in_nursery() -> terrace::Result<()> {
    let folder = tempfile::tempdir()?;

    let store = Config::new(folder.path()).open()?;

    store.put("k", "v1")?;
    store.put("k", "v2")?;

    assert_eq!(Some("v2".as_bytes().into()), store.get("k")?);

    Ok(())
}

#[test]
fn store_concurrent_reads_during_writes() -> terrace::Result<()> {
    let folder = tempfile::tempdir()?;

    let store = Config::new(folder.path()).open()?;

    for i in 0u64..100 {
        store.put(i.to_be_bytes(), b"seed")?;
    }

    let reader = {
        let store = store.clone();

        std::thread::spawn(move || -> terrace::Result<()> {
            for _ in 0..500 {
                for i in 0u64..100 {
                    assert!(store.get(i.to_be_bytes())?.is_some());
                }
            }
            Ok(())
        })
    };

    for round in 0u64..500 {
        for i in 0u64..100 {
            store.put(i.to_be_bytes(), round.to_be_bytes())?;
        }
    }

    reader.join().expect("reader should not panic")?;

    Ok(())
}
