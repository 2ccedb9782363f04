use terrace::Config;
use test_log::test;

// More than 4 times the top level's capacity (2^8), forcing at least
// two cascading merges into deeper levels
const ITEM_COUNT: u64 = 2_000;

#[test]
fn store_cascading_merges_keep_everything() -> terrace::Result<()> {
    let folder = tempfile::tempdir()?;

    let store = Config::new(folder.path()).open()?;

    for i in 0..ITEM_COUNT {
        store.put(i.to_be_bytes(), i.to_string())?;
    }

    let entries = store.fold(Vec::new(), |mut acc, key, value| {
        acc.push((key, value));
        Ok(acc)
    })?;

    assert_eq!(ITEM_COUNT as usize, entries.len());

    for (i, (key, value)) in entries.iter().enumerate() {
        assert_eq!(&**key, (i as u64).to_be_bytes().as_slice());
        assert_eq!(&**value, i.to_string().as_bytes());
    }

    // Each level may hold at most its two input files
    let mut files_per_level = std::collections::HashMap::new();
    for dirent in std::fs::read_dir(folder.path())? {
        let name = dirent?.file_name();
        let Some(name) = name.to_str().map(String::from) else {
            continue;
        };

        if let Some((_, level)) = name
            .strip_suffix(".data")
            .and_then(|stem| stem.rsplit_once('-'))
        {
            if let Ok(level) = level.parse::<u8>() {
                *files_per_level.entry(level).or_insert(0u32) += 1;
            }
        }
    }

    for (level, count) in files_per_level {
        assert!(count <= 2, "level {level} holds {count} files");
    }

    Ok(())
}

#[test]
fn store_cascading_merges_keep_latest_values() -> terrace::Result<()> {
    let folder = tempfile::tempdir()?;

    let store = Config::new(folder.path()).open()?;

    for i in 0..ITEM_COUNT {
        store.put(i.to_be_bytes(), "old")?;
    }
    for i in 0..ITEM_COUNT {
        store.put(i.to_be_bytes(), "new")?;
    }

    let entries = store.fold(Vec::new(), |mut acc, key, value| {
        acc.push((key, value));
        Ok(acc)
    })?;

    assert_eq!(ITEM_COUNT as usize, entries.len());
    assert!(entries.iter().all(|(_, value)| &**value == b"new"));

    Ok(())
}

#[test]
fn store_random_workload() -> terrace::Result<()> {
    use rand::{rngs::StdRng, Rng, SeedableRng};

    let folder = tempfile::tempdir()?;

    let store = Config::new(folder.path()).open()?;
    let mut rng = StdRng::seed_from_u64(42);

    let mut model = std::collections::BTreeMap::new();

    for _ in 0..5_000 {
        let key: u64 = rng.gen_range(0..500);

        if rng.gen_bool(0.2) {
            store.delete(key.to_be_bytes())?;
            model.remove(&key);
        } else {
            let value: u64 = rng.gen();
            store.put(key.to_be_bytes(), value.to_be_bytes())?;
            model.insert(key, value);
        }
    }

    for (key, value) in &model {
        assert_eq!(
            Some(value.to_be_bytes().as_slice().into()),
            store.get(key.to_be_bytes())?,
            "key {key} diverged",
        );
    }

    let count = store.fold(0usize, |acc, _, _| Ok(acc + 1))?;
    assert_eq!(model.len(), count);

    Ok(())
}

#[test]
fn store_cascade_survives_reopen() -> terrace::Result<()> {
    let folder = tempfile::tempdir()?;

    {
        let store = Config::new(folder.path()).open()?;
        for i in 0..ITEM_COUNT {
            store.put(i.to_be_bytes(), i.to_string())?;
        }
        store.close()?;
    }

    let store = Config::new(folder.path()).open()?;

    let count = store.fold(0u64, |acc, _, _| Ok(acc + 1))?;
    assert_eq!(ITEM_COUNT, count);

    for i in (0..ITEM_COUNT).step_by(97) {
        assert_eq!(
            Some(i.to_string().as_bytes().into()),
            store.get(i.to_be_bytes())?,
        );
    }

    Ok(())
}
