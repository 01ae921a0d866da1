use calicodb::{Db, DbOptions, Error, Result};

fn temp_db_path(dir: &tempfile::TempDir, name: &str) -> std::path::PathBuf {
    dir.path().join(name)
}

#[test]
fn put_then_get_round_trips_within_one_transaction() {
    let dir = tempfile::tempdir().unwrap();
    let path = temp_db_path(&dir, "basic.db");
    let mut db = Db::open(DbOptions::default(), &path).unwrap();

    db.update(|tx| {
        let mut fruits = tx.create_bucket(b"fruits")?;
        fruits.put(b"1", b"one")?;
        fruits.put(b"2", b"two")?;
        fruits.put(b"3", b"three")?;
        assert_eq!(fruits.get(b"1")?, Some(b"one".to_vec()));
        Ok(())
    })
    .unwrap();
}

#[test]
fn overwrite_replaces_the_previous_value() {
    let dir = tempfile::tempdir().unwrap();
    let path = temp_db_path(&dir, "overwrite.db");
    let mut db = Db::open(DbOptions::default(), &path).unwrap();

    db.update(|tx| {
        let mut b = tx.create_bucket(b"counters")?;
        b.put(b"2", b"two")?;
        b.put(b"2", b"two-two")?;
        Ok(())
    })
    .unwrap();

    db.view(|tx| {
        let mut b = tx.bucket(b"counters")?.unwrap();
        assert_eq!(b.get(b"2")?, Some(b"two-two".to_vec()));
        Ok(())
    })
    .unwrap();
}

#[test]
fn commit_survives_reopening_the_database() {
    let dir = tempfile::tempdir().unwrap();
    let path = temp_db_path(&dir, "reopen.db");

    {
        let mut db = Db::open(DbOptions::default(), &path).unwrap();
        db.update(|tx| {
            let mut b = tx.create_bucket(b"fruits")?;
            b.put(b"1", b"one")?;
            b.put(b"2", b"two")?;
            b.put(b"3", b"three")?;
            b.put(b"4", b"four")?;
            b.put(b"5", b"five")?;
            Ok(())
        })
        .unwrap();
    }

    {
        let mut opts = DbOptions::default();
        opts.create_if_missing = false;
        let mut db = Db::open(opts, &path).unwrap();
        db.view(|tx| {
            let mut b = tx.bucket(b"fruits")?.unwrap();
            assert_eq!(b.get(b"1")?, Some(b"one".to_vec()));
            assert_eq!(b.get(b"4")?, Some(b"four".to_vec()));
            Ok(())
        })
        .unwrap();
    }
}

#[test]
fn erase_removes_the_key_and_leaves_others_intact() {
    let dir = tempfile::tempdir().unwrap();
    let path = temp_db_path(&dir, "erase.db");
    let mut db = Db::open(DbOptions::default(), &path).unwrap();

    db.update(|tx| {
        let mut b = tx.create_bucket(b"fruits")?;
        for (k, v) in [(b"1", b"one"), (b"2", b"two"), (b"3", b"three"), (b"4", b"four")] {
            b.put(k, v)?;
        }
        Ok(())
    })
    .unwrap();

    db.update(|tx| {
        let mut b = tx.bucket(b"fruits")?.unwrap();
        assert!(b.erase(b"3")?);
        assert!(!b.erase(b"3")?);
        Ok(())
    })
    .unwrap();

    db.view(|tx| {
        let mut b = tx.bucket(b"fruits")?.unwrap();
        assert_eq!(b.get(b"1")?, Some(b"one".to_vec()));
        assert_eq!(b.get(b"3")?, None);
        assert_eq!(b.get(b"4")?, Some(b"four".to_vec()));
        Ok(())
    })
    .unwrap();
}

#[test]
fn a_failed_update_rolls_back_bucket_creation() {
    let dir = tempfile::tempdir().unwrap();
    let path = temp_db_path(&dir, "rollback_create.db");
    let mut db = Db::open(DbOptions::default(), &path).unwrap();

    let result: Result<()> = db.update(|tx| {
        let mut b = tx.create_bucket(b"orders")?;
        b.put(b"o1", b"pending")?;
        Err(Error::invalid_argument("caller changed its mind"))
    });
    assert!(result.is_err());

    db.view(|tx| {
        assert!(tx.bucket(b"orders")?.is_none());
        Ok(())
    })
    .unwrap();
}

#[test]
fn cursor_walks_keys_in_order_both_directions() {
    let dir = tempfile::tempdir().unwrap();
    let path = temp_db_path(&dir, "cursor.db");
    let mut db = Db::open(DbOptions::default(), &path).unwrap();

    db.update(|tx| {
        let mut b = tx.create_bucket(b"letters")?;
        for k in ["b", "d", "a", "c"] {
            b.put(k.as_bytes(), b"x")?;
        }
        Ok(())
    })
    .unwrap();

    db.view(|tx| {
        let mut b = tx.bucket(b"letters")?.unwrap();
        let mut cursor = b.cursor();
        cursor.seek_first()?;
        let mut forward = Vec::new();
        while cursor.is_valid() {
            forward.push(cursor.key().unwrap().to_vec());
            cursor.next()?;
        }
        assert_eq!(forward, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]);

        cursor.seek_last()?;
        let mut backward = Vec::new();
        while cursor.is_valid() {
            backward.push(cursor.key().unwrap().to_vec());
            cursor.previous()?;
        }
        assert_eq!(backward, vec![b"d".to_vec(), b"c".to_vec(), b"b".to_vec(), b"a".to_vec()]);
        Ok(())
    })
    .unwrap();
}

#[test]
fn checkpoint_truncates_the_wal_without_losing_committed_data() {
    let dir = tempfile::tempdir().unwrap();
    let path = temp_db_path(&dir, "checkpoint.db");
    let mut db = Db::open(DbOptions::default(), &path).unwrap();

    db.update(|tx| {
        let mut b = tx.create_bucket(b"fruits")?;
        for i in 0..200u32 {
            b.put(format!("key-{i:04}").as_bytes(), b"value")?;
        }
        Ok(())
    })
    .unwrap();

    db.checkpoint(true).unwrap();

    db.view(|tx| {
        let mut b = tx.bucket(b"fruits")?.unwrap();
        assert_eq!(b.get(b"key-0000")?, Some(b"value".to_vec()));
        assert_eq!(b.get(b"key-0199")?, Some(b"value".to_vec()));
        Ok(())
    })
    .unwrap();
}

#[test]
fn overflow_values_round_trip_and_erase_frees_their_pages() {
    let dir = tempfile::tempdir().unwrap();
    let path = temp_db_path(&dir, "overflow.db");
    let mut opts = DbOptions::default();
    opts.page_size = 512;
    let mut db = Db::open(opts, &path).unwrap();

    // Comfortably larger than one 512-byte page's local payload capacity,
    // forcing an overflow chain.
    let big_value = vec![0xab; 4000];

    db.update(|tx| {
        let mut b = tx.create_bucket(b"blobs")?;
        b.put(b"big", &big_value)?;
        Ok(())
    })
    .unwrap();

    db.view(|tx| {
        let mut b = tx.bucket(b"blobs")?.unwrap();
        assert_eq!(b.get(b"big")?, Some(big_value.clone()));
        Ok(())
    })
    .unwrap();

    db.update(|tx| {
        let mut b = tx.bucket(b"blobs")?.unwrap();
        assert!(b.erase(b"big")?);
        Ok(())
    })
    .unwrap();

    db.view(|tx| {
        let mut b = tx.bucket(b"blobs")?.unwrap();
        assert_eq!(b.get(b"big")?, None);
        Ok(())
    })
    .unwrap();
}

#[test]
fn vacuum_shrinks_the_file_after_dropping_a_large_bucket() {
    let dir = tempfile::tempdir().unwrap();
    let path = temp_db_path(&dir, "vacuum.db");
    let mut opts = DbOptions::default();
    opts.page_size = 512;
    let mut db = Db::open(opts, &path).unwrap();

    db.update(|tx| {
        let mut b = tx.create_bucket(b"scratch")?;
        for i in 0..500u32 {
            b.put(format!("k{i:05}").as_bytes(), &vec![7u8; 100])?;
        }
        Ok(())
    })
    .unwrap();
    let page_count_before = db.stats().unwrap().page_count;

    db.update(|tx| {
        tx.drop_bucket(b"scratch")?;
        tx.vacuum()?;
        Ok(())
    })
    .unwrap();

    assert!(db.stats().unwrap().page_count < page_count_before);
}

#[test]
fn multiple_buckets_keep_independent_key_spaces() {
    let dir = tempfile::tempdir().unwrap();
    let path = temp_db_path(&dir, "multi_bucket.db");
    let mut db = Db::open(DbOptions::default(), &path).unwrap();

    db.update(|tx| {
        let mut a = tx.create_bucket(b"a")?;
        a.put(b"shared", b"from-a")?;
        let mut b = tx.create_bucket(b"b")?;
        b.put(b"shared", b"from-b")?;
        Ok(())
    })
    .unwrap();

    db.view(|tx| {
        let mut a = tx.bucket(b"a")?.unwrap();
        assert_eq!(a.get(b"shared")?, Some(b"from-a".to_vec()));
        let mut b = tx.bucket(b"b")?.unwrap();
        assert_eq!(b.get(b"shared")?, Some(b"from-b".to_vec()));
        Ok(())
    })
    .unwrap();

    let names = db.view(|tx| tx.list_buckets()).unwrap();
    assert_eq!(names, vec![b"a".to_vec(), b"b".to_vec()]);
}

#[test]
fn concurrent_readers_see_a_stable_snapshot_across_a_writer_commit() {
    let dir = tempfile::tempdir().unwrap();
    let path = temp_db_path(&dir, "snapshot.db");

    {
        let mut writer = Db::open(DbOptions::default(), &path).unwrap();
        writer
            .update(|tx| {
                let mut b = tx.create_bucket(b"fruits")?;
                b.put(b"apple", b"red")?;
                Ok(())
            })
            .unwrap();
    }

    // A second, independent connection to the same file plays the role of a
    // concurrent reader.
    let mut opts = DbOptions::default();
    opts.create_if_missing = false;
    let mut reader = Db::open(opts.clone(), &path).unwrap();
    let mut writer = Db::open(opts, &path).unwrap();

    reader
        .view(|tx| {
            let mut b = tx.bucket(b"fruits")?.unwrap();
            assert_eq!(b.get(b"apple")?, Some(b"red".to_vec()));
            Ok(())
        })
        .unwrap();

    writer
        .update(|tx| {
            let mut b = tx.bucket(b"fruits")?.unwrap();
            b.put(b"apple", b"green")?;
            Ok(())
        })
        .unwrap();

    reader
        .view(|tx| {
            let mut b = tx.bucket(b"fruits")?.unwrap();
            assert_eq!(b.get(b"apple")?, Some(b"green".to_vec()));
            Ok(())
        })
        .unwrap();
}

#[test]
fn destroy_removes_the_database_and_its_wal() {
    let dir = tempfile::tempdir().unwrap();
    let path = temp_db_path(&dir, "destroy.db");
    {
        let mut db = Db::open(DbOptions::default(), &path).unwrap();
        db.update(|tx| {
            let mut b = tx.create_bucket(b"fruits")?;
            b.put(b"apple", b"red")?;
            Ok(())
        })
        .unwrap();
    }
    assert!(path.exists());
    Db::destroy(DbOptions::default(), &path).unwrap();
    assert!(!path.exists());
}
