//! Block ciphers, cascades and the sector-level XTS engine.
//!
//! Every supported encryption algorithm is a stack of one to three XTS
//! layers. The innermost layer operates on plaintext; each further layer
//! encrypts the previous layer's output. Cascade names list the outermost
//! cipher first (so "AES-Twofish" encrypts with Twofish, then AES).
//!
//! Key material layout, both for header keys and the master-key area:
//! all primary keys concatenated innermost-first, then all secondary
//! (tweak) keys in the same order. A single cipher therefore takes 64
//! bytes, a triple cascade 192.

use aes::Aes256;
use cipher::KeyInit;
use serpent::Serpent;
use twofish::Twofish;
use xts_mode::{get_tweak_default, Xts128};

use crate::error::{Error, Result};
use crate::memory::ct_eq;

/// Cipher block size. XTS requires it; all supported ciphers share it.
pub const CIPHER_BLOCK_SIZE: usize = 16;

/// Key size of each supported cipher (all are 256-bit).
pub const CIPHER_KEY_SIZE: usize = 32;

/// Primary + secondary key per cipher.
pub const XTS_KEY_SIZE: usize = 2 * CIPHER_KEY_SIZE;

/// Largest key material any algorithm needs (a triple cascade).
pub const MAX_KEY_MATERIAL: usize = 3 * XTS_KEY_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherKind {
    Aes,
    Serpent,
    Twofish,
}

impl CipherKind {
    pub fn name(&self) -> &'static str {
        match self {
            CipherKind::Aes => "AES",
            CipherKind::Serpent => "Serpent",
            CipherKind::Twofish => "Twofish",
        }
    }
}

/// The supported encryption algorithms: three single ciphers and the five
/// cascades of the TrueCrypt format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionAlgorithm {
    Aes,
    Serpent,
    Twofish,
    AesTwofish,
    AesTwofishSerpent,
    SerpentAes,
    SerpentTwofishAes,
    TwofishSerpent,
}

impl EncryptionAlgorithm {
    /// Probe order when opening a volume. Single ciphers first; they are the
    /// cheapest rejection.
    pub fn all() -> &'static [EncryptionAlgorithm] {
        &[
            EncryptionAlgorithm::Aes,
            EncryptionAlgorithm::Serpent,
            EncryptionAlgorithm::Twofish,
            EncryptionAlgorithm::AesTwofish,
            EncryptionAlgorithm::AesTwofishSerpent,
            EncryptionAlgorithm::SerpentAes,
            EncryptionAlgorithm::SerpentTwofishAes,
            EncryptionAlgorithm::TwofishSerpent,
        ]
    }

    /// The cipher stack in application order, innermost first.
    pub fn cascade(&self) -> &'static [CipherKind] {
        use CipherKind::*;
        match self {
            EncryptionAlgorithm::Aes => &[Aes],
            EncryptionAlgorithm::Serpent => &[Serpent],
            EncryptionAlgorithm::Twofish => &[Twofish],
            EncryptionAlgorithm::AesTwofish => &[Twofish, Aes],
            EncryptionAlgorithm::AesTwofishSerpent => &[Serpent, Twofish, Aes],
            EncryptionAlgorithm::SerpentAes => &[Aes, Serpent],
            EncryptionAlgorithm::SerpentTwofishAes => &[Aes, Twofish, Serpent],
            EncryptionAlgorithm::TwofishSerpent => &[Serpent, Twofish],
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            EncryptionAlgorithm::Aes => "AES",
            EncryptionAlgorithm::Serpent => "Serpent",
            EncryptionAlgorithm::Twofish => "Twofish",
            EncryptionAlgorithm::AesTwofish => "AES-Twofish",
            EncryptionAlgorithm::AesTwofishSerpent => "AES-Twofish-Serpent",
            EncryptionAlgorithm::SerpentAes => "Serpent-AES",
            EncryptionAlgorithm::SerpentTwofishAes => "Serpent-Twofish-AES",
            EncryptionAlgorithm::TwofishSerpent => "Twofish-Serpent",
        }
    }

    /// Resolve by name. Camellia and Kuznyechik identifiers from VeraCrypt
    /// volumes are recognised but rejected; no key derivation is ever
    /// attempted for them.
    pub fn from_name(name: &str) -> Result<EncryptionAlgorithm> {
        let canon = name.to_ascii_lowercase().replace('_', "-");
        match canon.as_str() {
            "aes" => Ok(EncryptionAlgorithm::Aes),
            "serpent" => Ok(EncryptionAlgorithm::Serpent),
            "twofish" => Ok(EncryptionAlgorithm::Twofish),
            "aes-twofish" => Ok(EncryptionAlgorithm::AesTwofish),
            "aes-twofish-serpent" => Ok(EncryptionAlgorithm::AesTwofishSerpent),
            "serpent-aes" => Ok(EncryptionAlgorithm::SerpentAes),
            "serpent-twofish-aes" => Ok(EncryptionAlgorithm::SerpentTwofishAes),
            "twofish-serpent" => Ok(EncryptionAlgorithm::TwofishSerpent),
            _ if canon.contains("camellia") || canon.contains("kuznyechik") => {
                Err(Error::VeraCryptCipherNotSupported(name.to_string()))
            }
            _ => Err(Error::ParameterIncorrect("unknown encryption algorithm")),
        }
    }

    pub fn depth(&self) -> usize {
        self.cascade().len()
    }

    /// Total key material: primary + secondary key per cascade member.
    pub fn key_material_size(&self) -> usize {
        self.depth() * XTS_KEY_SIZE
    }
}

/// One XTS layer over a concrete cipher. The underlying key schedules are
/// zeroised when the layer drops.
enum XtsLayer {
    Aes(Box<Xts128<Aes256>>),
    Serpent(Box<Xts128<Serpent>>),
    Twofish(Box<Xts128<Twofish>>),
}

impl XtsLayer {
    fn new(kind: CipherKind, primary: &[u8], secondary: &[u8]) -> Result<XtsLayer> {
        let bad_key = |_| Error::ParameterIncorrect("cipher key length");
        Ok(match kind {
            CipherKind::Aes => XtsLayer::Aes(Box::new(Xts128::new(
                Aes256::new_from_slice(primary).map_err(bad_key)?,
                Aes256::new_from_slice(secondary).map_err(bad_key)?,
            ))),
            CipherKind::Serpent => XtsLayer::Serpent(Box::new(Xts128::new(
                Serpent::new_from_slice(primary).map_err(bad_key)?,
                Serpent::new_from_slice(secondary).map_err(bad_key)?,
            ))),
            CipherKind::Twofish => XtsLayer::Twofish(Box::new(Xts128::new(
                Twofish::new_from_slice(primary).map_err(bad_key)?,
                Twofish::new_from_slice(secondary).map_err(bad_key)?,
            ))),
        })
    }

    fn encrypt_area(&self, data: &mut [u8], sector_size: usize, first_sector_index: u128) {
        match self {
            XtsLayer::Aes(xts) => {
                xts.encrypt_area(data, sector_size, first_sector_index, get_tweak_default)
            }
            XtsLayer::Serpent(xts) => {
                xts.encrypt_area(data, sector_size, first_sector_index, get_tweak_default)
            }
            XtsLayer::Twofish(xts) => {
                xts.encrypt_area(data, sector_size, first_sector_index, get_tweak_default)
            }
        }
    }

    fn decrypt_area(&self, data: &mut [u8], sector_size: usize, first_sector_index: u128) {
        match self {
            XtsLayer::Aes(xts) => {
                xts.decrypt_area(data, sector_size, first_sector_index, get_tweak_default)
            }
            XtsLayer::Serpent(xts) => {
                xts.decrypt_area(data, sector_size, first_sector_index, get_tweak_default)
            }
            XtsLayer::Twofish(xts) => {
                xts.decrypt_area(data, sector_size, first_sector_index, get_tweak_default)
            }
        }
    }
}

/// A keyed cascade ready for sector I/O. Owns the key schedules of every
/// layer; dropping the cascade wipes them.
pub struct CipherCascade {
    algorithm: EncryptionAlgorithm,
    layers: Vec<XtsLayer>,
}

impl std::fmt::Debug for CipherCascade {
    /// Manual impl: `layers` holds key schedules and must never be
    /// formatted, so this deliberately omits it rather than deriving.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherCascade")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

impl CipherCascade {
    /// Build a cascade from raw key material laid out as described in the
    /// module docs. Fails with `ParameterIncorrect` if any layer's primary
    /// key equals its secondary key (the XTS weak-key condition) or if the
    /// material is too short.
    pub fn from_key_material(
        algorithm: EncryptionAlgorithm,
        key_material: &[u8],
    ) -> Result<CipherCascade> {
        let cascade = algorithm.cascade();
        let depth = cascade.len();
        if key_material.len() < algorithm.key_material_size() {
            return Err(Error::ParameterIncorrect("key material too short"));
        }

        let mut layers = Vec::with_capacity(depth);
        for (i, kind) in cascade.iter().enumerate() {
            let primary = &key_material[i * CIPHER_KEY_SIZE..(i + 1) * CIPHER_KEY_SIZE];
            let secondary_base = depth * CIPHER_KEY_SIZE;
            let secondary = &key_material
                [secondary_base + i * CIPHER_KEY_SIZE..secondary_base + (i + 1) * CIPHER_KEY_SIZE];

            if ct_eq(primary, secondary) {
                return Err(Error::ParameterIncorrect(
                    "XTS primary and secondary keys are equal",
                ));
            }
            layers.push(XtsLayer::new(*kind, primary, secondary)?);
        }

        Ok(CipherCascade { algorithm, layers })
    }

    pub fn algorithm(&self) -> EncryptionAlgorithm {
        self.algorithm
    }

    /// Encrypt whole sectors in place. `data` must be a multiple of
    /// `sector_size`; tweaks run from `first_sector_index` upward, encoded
    /// little-endian per IEEE 1619.
    pub fn encrypt_area(&self, data: &mut [u8], sector_size: usize, first_sector_index: u64) {
        for layer in &self.layers {
            layer.encrypt_area(data, sector_size, first_sector_index as u128);
        }
    }

    /// Decrypt whole sectors in place. Layers unwind outermost-first.
    pub fn decrypt_area(&self, data: &mut [u8], sector_size: usize, first_sector_index: u64) {
        for layer in self.layers.iter().rev() {
            layer.decrypt_area(data, sector_size, first_sector_index as u128);
        }
    }
}

#[cfg(any(target_arch = "x86_64", target_arch = "x86", target_arch = "aarch64"))]
mod hw {
    cpufeatures::new!(cpuid_aes, "aes");

    pub fn available() -> bool {
        cpuid_aes::get()
    }
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "x86", target_arch = "aarch64")))]
mod hw {
    pub fn available() -> bool {
        false
    }
}

/// Whether the CPU exposes AES instructions (AES-NI / ARMv8 AES). The `aes`
/// crate performs the same detection internally and dispatches to the
/// hardware implementation; this report exists for diagnostics only.
pub fn hardware_aes_available() -> bool {
    hw::available()
}

#[cfg(test)]
mod tests {
    use super::*;
    use cipher::generic_array::GenericArray;
    use cipher::{BlockDecrypt, BlockEncrypt};

    fn test_key_material(depth: usize) -> Vec<u8> {
        // Distinct primary/secondary halves per layer.
        (0..depth * XTS_KEY_SIZE).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn aes256_fips197_vector() {
        // FIPS-197 appendix C.3.
        let key: Vec<u8> = (0u8..32).collect();
        let cipher = Aes256::new_from_slice(&key).unwrap();
        let mut block = GenericArray::clone_from_slice(
            &hex::decode("00112233445566778899aabbccddeeff").unwrap(),
        );
        cipher.encrypt_block(&mut block);
        assert_eq!(hex::encode(block), "8ea2b7ca516745bfeafc49904b496089");
        cipher.decrypt_block(&mut block);
        assert_eq!(hex::encode(block), "00112233445566778899aabbccddeeff");
    }

    #[test]
    fn twofish256_zero_vector() {
        // Twofish ECB table, 256-bit key, I=1.
        let cipher = Twofish::new_from_slice(&[0u8; 32]).unwrap();
        let mut block = GenericArray::clone_from_slice(&[0u8; 16]);
        cipher.encrypt_block(&mut block);
        assert_eq!(
            hex::encode(block).to_uppercase(),
            "57FF739D4DC92C1BD7FC01700CC8216F"
        );
    }

    #[test]
    fn serpent_round_trip() {
        let cipher = Serpent::new_from_slice(&[7u8; 32]).unwrap();
        let mut block = GenericArray::clone_from_slice(b"0123456789abcdef");
        cipher.encrypt_block(&mut block);
        assert_ne!(&block[..], b"0123456789abcdef");
        cipher.decrypt_block(&mut block);
        assert_eq!(&block[..], b"0123456789abcdef");
    }

    #[test]
    fn xts_round_trip_every_algorithm() {
        let mut sector = vec![0u8; 512];
        for (i, b) in sector.iter_mut().enumerate() {
            *b = (i % 256) as u8;
        }
        let reference = sector.clone();

        for alg in EncryptionAlgorithm::all() {
            let cascade =
                CipherCascade::from_key_material(*alg, &test_key_material(alg.depth())).unwrap();
            let mut data = sector.clone();
            cascade.encrypt_area(&mut data, 512, 3);
            assert_ne!(data, reference, "{} did not change data", alg.name());
            cascade.decrypt_area(&mut data, 512, 3);
            assert_eq!(data, reference, "{} round trip", alg.name());
        }
    }

    #[test]
    fn xts_tweak_distinguishes_sectors() {
        let cascade =
            CipherCascade::from_key_material(EncryptionAlgorithm::Aes, &test_key_material(1))
                .unwrap();
        let mut a = vec![0u8; 512];
        let mut b = vec![0u8; 512];
        cascade.encrypt_area(&mut a, 512, 0);
        cascade.encrypt_area(&mut b, 512, 1);
        assert_ne!(a, b);
    }

    #[test]
    fn cascade_layers_compose() {
        // AES-Twofish must equal Twofish followed by AES with the matching
        // key slices.
        let km = test_key_material(2);
        let cascade =
            CipherCascade::from_key_material(EncryptionAlgorithm::AesTwofish, &km).unwrap();

        let mut tf_km = Vec::new();
        tf_km.extend_from_slice(&km[0..32]); // inner primary
        tf_km.extend_from_slice(&km[64..96]); // inner secondary
        let twofish =
            CipherCascade::from_key_material(EncryptionAlgorithm::Twofish, &tf_km).unwrap();

        let mut aes_km = Vec::new();
        aes_km.extend_from_slice(&km[32..64]);
        aes_km.extend_from_slice(&km[96..128]);
        let aes = CipherCascade::from_key_material(EncryptionAlgorithm::Aes, &aes_km).unwrap();

        let mut composed = vec![0x5au8; 512];
        twofish.encrypt_area(&mut composed, 512, 9);
        aes.encrypt_area(&mut composed, 512, 9);

        let mut direct = vec![0x5au8; 512];
        cascade.encrypt_area(&mut direct, 512, 9);

        assert_eq!(composed, direct);
    }

    #[test]
    fn equal_xts_halves_rejected() {
        let mut km = vec![0u8; XTS_KEY_SIZE];
        km[..CIPHER_KEY_SIZE].copy_from_slice(&[9u8; 32]);
        km[CIPHER_KEY_SIZE..].copy_from_slice(&[9u8; 32]);
        let err = CipherCascade::from_key_material(EncryptionAlgorithm::Aes, &km).unwrap_err();
        assert!(matches!(err, Error::ParameterIncorrect(_)));
    }

    #[test]
    fn unsupported_veracrypt_ciphers() {
        assert!(matches!(
            EncryptionAlgorithm::from_name("Camellia"),
            Err(Error::VeraCryptCipherNotSupported(_))
        ));
        assert!(matches!(
            EncryptionAlgorithm::from_name("Kuznyechik-Twofish"),
            Err(Error::VeraCryptCipherNotSupported(_))
        ));
    }

    #[test]
    fn names_round_trip() {
        for alg in EncryptionAlgorithm::all() {
            assert_eq!(EncryptionAlgorithm::from_name(alg.name()).unwrap(), *alg);
        }
    }
}
