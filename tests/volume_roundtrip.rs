//! End-to-end volume round trips through the public API.

use std::path::PathBuf;

use basalt::create::{create_volume, CreateOptions, FilesystemType};
use basalt::{rng, EncryptionAlgorithm, Error, Kdf, OpenOptions, Password, Volume};

fn temp_path(name: &str) -> PathBuf {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(name);
    std::mem::forget(dir);
    path
}

fn create(path: &PathBuf, size: u64, algorithm: EncryptionAlgorithm, password: &str) {
    rng::start().unwrap();
    create_volume(
        CreateOptions {
            path: path.clone(),
            size,
            algorithm,
            kdf: Kdf::Pbkdf2Sha512Legacy,
            password: Password::from_str(password).unwrap(),
            keyfiles: Vec::new(),
            filesystem: FilesystemType::None,
            quick: true,
            sector_size: 512,
            hidden_size: None,
            hidden_password: None,
        },
        None,
        &mut |_, _| {},
    )
    .unwrap();
}

fn pseudo_random(len: usize, seed: u64) -> Vec<u8> {
    // Deterministic payload so the comparison is reproducible.
    let mut state = seed;
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (state >> 33) as u8
        })
        .collect()
}

#[test]
fn ten_mib_volume_write_dismount_remount_read() {
    let path = temp_path("roundtrip.bslt");
    create(&path, 10 * 1024 * 1024, EncryptionAlgorithm::Aes, "round trip password");

    // 5 MiB payload at sector offset 1024.
    let payload = pseudo_random(5 * 1024 * 1024, 0xBA5A17);
    let byte_offset = 1024 * 512;

    let mut volume = Volume::open(OpenOptions::new(
        &path,
        Password::from_str("round trip password").unwrap(),
    ))
    .unwrap();
    volume.write_sectors(byte_offset, &payload).unwrap();
    volume.flush().unwrap();
    drop(volume); // dismount

    let mut volume = Volume::open(OpenOptions::new(
        &path,
        Password::from_str("round trip password").unwrap(),
    ))
    .unwrap();
    let mut read_back = vec![0u8; payload.len()];
    volume.read_sectors(byte_offset, &mut read_back).unwrap();
    assert_eq!(read_back, payload);
}

#[test]
fn every_cascade_round_trips() {
    for &algorithm in EncryptionAlgorithm::all() {
        let path = temp_path(&format!("cascade_{}.bslt", algorithm.name()));
        create(&path, 1024 * 1024, algorithm, "cascade password");

        let mut volume = Volume::open(OpenOptions::new(
            &path,
            Password::from_str("cascade password").unwrap(),
        ))
        .unwrap();
        assert_eq!(volume.algorithm(), algorithm, "{}", algorithm.name());

        let payload = pseudo_random(4096, 0xC0FFEE);
        volume.write_sectors(2048, &payload).unwrap();
        let mut back = vec![0u8; payload.len()];
        volume.read_sectors(2048, &mut back).unwrap();
        assert_eq!(back, payload, "{}", algorithm.name());
    }
}

#[test]
fn wrong_password_is_uninformative() {
    let path = temp_path("wrong.bslt");
    create(&path, 1024 * 1024, EncryptionAlgorithm::Aes, "right");

    let mut options = OpenOptions::new(&path, Password::from_str("wrong").unwrap());
    options.kdf = Some(Kdf::Pbkdf2Sha512Legacy);
    let err = Volume::open(options).unwrap_err();
    assert!(matches!(err, Error::PasswordIncorrect));
    let text = err.to_string();
    for leak in ["AES", "SHA", "RIPEMD", "Whirlpool", "salt", "iteration", "layout"] {
        assert!(!text.contains(leak), "'{text}' leaks {leak}");
    }
}

#[test]
fn keyfile_is_a_second_factor() {
    use std::io::Write;

    let path = temp_path("keyfile.bslt");
    let mut keyfile = tempfile::NamedTempFile::new().unwrap();
    keyfile.write_all(b"keyfile secret material").unwrap();
    let keyfiles = vec![keyfile.path().to_path_buf()];

    rng::start().unwrap();
    create_volume(
        CreateOptions {
            path: path.clone(),
            size: 1024 * 1024,
            algorithm: EncryptionAlgorithm::Aes,
            kdf: Kdf::Pbkdf2Sha512Legacy,
            password: Password::from_str("pw").unwrap(),
            keyfiles: keyfiles.clone(),
            filesystem: FilesystemType::None,
            quick: true,
            sector_size: 512,
            hidden_size: None,
            hidden_password: None,
        },
        None,
        &mut |_, _| {},
    )
    .unwrap();

    // Password alone does not open the volume.
    let mut options = OpenOptions::new(&path, Password::from_str("pw").unwrap());
    options.kdf = Some(Kdf::Pbkdf2Sha512Legacy);
    let err = Volume::open(options).unwrap_err();
    assert!(matches!(err, Error::PasswordIncorrect));

    // Password plus keyfile does.
    let mut options = OpenOptions::new(&path, Password::from_str("pw").unwrap());
    options.keyfiles = keyfiles.clone();
    let volume = Volume::open(options).unwrap();
    assert_eq!(volume.algorithm(), EncryptionAlgorithm::Aes);

    // Password plus the wrong keyfile reports the keyfile variant.
    let mut other = tempfile::NamedTempFile::new().unwrap();
    other.write_all(b"a different keyfile").unwrap();
    let mut options = OpenOptions::new(&path, Password::from_str("pw").unwrap());
    options.keyfiles = vec![other.path().to_path_buf()];
    options.kdf = Some(Kdf::Pbkdf2Sha512Legacy);
    let err = Volume::open(options).unwrap_err();
    assert!(matches!(err, Error::PasswordKeyfilesIncorrect));
}

#[test]
fn read_only_remount_sees_earlier_writes() {
    let path = temp_path("ro.bslt");
    create(&path, 1024 * 1024, EncryptionAlgorithm::Twofish, "pw");

    let payload = pseudo_random(1024, 42);
    {
        let mut volume =
            Volume::open(OpenOptions::new(&path, Password::from_str("pw").unwrap())).unwrap();
        volume.write_sectors(0, &payload).unwrap();
    }

    let mut options = OpenOptions::new(&path, Password::from_str("pw").unwrap());
    options.read_only = true;
    let mut volume = Volume::open(options).unwrap();
    let mut back = vec![0u8; payload.len()];
    volume.read_sectors(0, &mut back).unwrap();
    assert_eq!(back, payload);
    assert!(matches!(
        volume.write_sectors(0, &payload),
        Err(Error::VolumeReadOnly)
    ));
}

#[test]
fn volume_info_reflects_mount_state() {
    let path = temp_path("info.bslt");
    create(&path, 1024 * 1024, EncryptionAlgorithm::SerpentAes, "pw");

    let mut volume =
        Volume::open(OpenOptions::new(&path, Password::from_str("pw").unwrap())).unwrap();
    volume.write_sectors(0, &[1u8; 512]).unwrap();
    let mut buf = [0u8; 1024];
    volume.read_sectors(0, &mut buf).unwrap();

    let info = volume.info(5, Some(PathBuf::from("/mnt/vault")));
    assert_eq!(info.slot, 5);
    assert_eq!(info.encryption_algorithm, "Serpent-AES");
    assert_eq!(info.kdf_name, "PBKDF2-HMAC-SHA512");
    assert_eq!(info.iteration_count, 1000);
    assert_eq!(info.bytes_written, 512);
    assert_eq!(info.bytes_read, 1024);
    assert!(!info.hidden);
    assert!(!info.read_only);
}
