//! Creation and remount with the Argon2id KDF. These allocate hundreds of
//! MiB per derivation, so they are opt-in (`cargo test -- --ignored`).

use std::path::PathBuf;

use basalt::create::{create_volume, CreateOptions, FilesystemType};
use basalt::{rng, EncryptionAlgorithm, Kdf, OpenOptions, Password, Volume};

fn temp_path(name: &str) -> PathBuf {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(name);
    std::mem::forget(dir);
    path
}

#[test]
#[ignore = "Argon2id derivations allocate 512 MiB each"]
fn create_and_remount_with_argon2id() {
    rng::start().unwrap();
    let path = temp_path("argon2.bslt");

    create_volume(
        CreateOptions {
            path: path.clone(),
            size: 4 * 1024 * 1024,
            algorithm: EncryptionAlgorithm::Aes,
            kdf: Kdf::Argon2id,
            password: Password::from_str("correct horse battery staple").unwrap(),
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

    let mut options = OpenOptions::new(
        &path,
        Password::from_str("correct horse battery staple").unwrap(),
    );
    options.kdf = Some(Kdf::Argon2id);
    let volume = Volume::open(options).unwrap();
    let info = volume.info(1, None);
    assert_eq!(info.encryption_algorithm, "AES");
    assert_eq!(info.kdf_name, "Argon2id");
    assert_eq!(info.iteration_count, 4);
}

#[test]
#[ignore = "the full candidate sweep allocates up to 1 GiB for Argon2id-Max"]
fn argon2id_volume_found_by_full_sweep() {
    rng::start().unwrap();
    let path = temp_path("argon2_sweep.bslt");

    create_volume(
        CreateOptions {
            path: path.clone(),
            size: 4 * 1024 * 1024,
            algorithm: EncryptionAlgorithm::Aes,
            kdf: Kdf::Argon2id,
            password: Password::from_str("correct horse battery staple").unwrap(),
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

    // No hint: legacy rows, then Argon2id-Max, then Argon2id matches.
    let volume = Volume::open(OpenOptions::new(
        &path,
        Password::from_str("correct horse battery staple").unwrap(),
    ))
    .unwrap();
    assert_eq!(volume.kdf(), Kdf::Argon2id);
}
