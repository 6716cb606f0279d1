//! Consensus parameter definitions.

use std::fmt;

use crate::Hash256;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    pub fn as_str(self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Regtest => "regtest",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "main" | "mainnet" => Some(Network::Mainnet),
            "test" | "testnet" => Some(Network::Testnet),
            "regtest" => Some(Network::Regtest),
            _ => None,
        }
    }
}

/// Header fields of the root block every chain descends from.
#[derive(Clone, Copy, Debug)]
pub struct Genesis {
    pub hash: Hash256,
    pub version: i32,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Checkpoint {
    pub height: u32,
    pub hash: Hash256,
}

#[derive(Clone, Debug)]
pub struct ConsensusParams {
    pub network: Network,
    pub genesis: Genesis,
    pub subsidy_halving_interval: u32,
    /// Upgraded versions needed in the window before older versions are rejected.
    pub majority_reject_block_outdated: usize,
    pub majority_window: usize,
    /// Blocks with a timestamp at or after this enforce pay-to-script-hash.
    pub bip16_switch_time: u32,
    /// Historical blocks allowed to overwrite unspent coinbase outputs.
    pub bip30_exceptions: Vec<Checkpoint>,
    pub checkpoints: Vec<Checkpoint>,
    /// Easiest target allowed, little-endian.
    pub pow_limit: Hash256,
    pub pow_target_timespan: i64,
    pub pow_target_spacing: i64,
    pub pow_no_retargeting: bool,
}

impl ConsensusParams {
    /// Number of blocks between difficulty adjustments.
    pub fn retarget_interval(&self) -> u32 {
        (self.pow_target_timespan / self.pow_target_spacing) as u32
    }

    pub fn checkpoint_at(&self, height: u32) -> Option<&Checkpoint> {
        self.checkpoints.iter().find(|cp| cp.height == height)
    }
}

#[derive(Debug, Eq, PartialEq)]
pub enum HexError {
    InvalidLength,
    InvalidHex,
}

impl fmt::Display for HexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HexError::InvalidLength => write!(f, "hash hex has invalid length"),
            HexError::InvalidHex => write!(f, "hash hex has invalid characters"),
        }
    }
}

impl std::error::Error for HexError {}

/// Parse a display-order (big-endian) hash into internal byte order.
///
/// Short inputs are left-padded with zeros.
pub fn hash256_from_hex(input: &str) -> Result<Hash256, HexError> {
    let mut hex = input.trim();
    if let Some(stripped) = hex.strip_prefix("0x").or_else(|| hex.strip_prefix("0X")) {
        hex = stripped;
    }
    if hex.is_empty() || hex.len() > 64 {
        return Err(HexError::InvalidLength);
    }
    if !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(HexError::InvalidHex);
    }

    let padded = format!("{hex:0>64}");
    let mut bytes = [0u8; 32];
    for (i, byte_out) in bytes.iter_mut().enumerate() {
        *byte_out = u8::from_str_radix(&padded[i * 2..i * 2 + 2], 16)
            .map_err(|_| HexError::InvalidHex)?;
    }
    bytes.reverse();
    Ok(bytes)
}

/// Display-order hex of an internal-order hash.
pub fn hash256_to_hex(hash: &Hash256) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(64);
    for byte in hash.iter().rev() {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

pub fn consensus_params(network: Network) -> ConsensusParams {
    match network {
        Network::Mainnet => mainnet_consensus_params(),
        Network::Testnet => testnet_consensus_params(),
        Network::Regtest => regtest_consensus_params(),
    }
}

const GENESIS_MERKLE_ROOT: &str =
    "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b";

fn hash(hex: &str) -> Hash256 {
    match hash256_from_hex(hex) {
        Ok(hash) => hash,
        Err(err) => panic!("invalid built-in hash {hex}: {err}"),
    }
}

fn parse_checkpoints(entries: &[(u32, &str)]) -> Vec<Checkpoint> {
    entries
        .iter()
        .map(|(height, hex)| Checkpoint {
            height: *height,
            hash: hash(hex),
        })
        .collect()
}

fn mainnet_consensus_params() -> ConsensusParams {
    ConsensusParams {
        network: Network::Mainnet,
        genesis: Genesis {
            hash: hash("000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"),
            version: 1,
            merkle_root: hash(GENESIS_MERKLE_ROOT),
            time: 1_231_006_505,
            bits: 0x1d00_ffff,
            nonce: 2_083_236_893,
        },
        subsidy_halving_interval: 210_000,
        majority_reject_block_outdated: 950,
        majority_window: 1_000,
        bip16_switch_time: 1_333_238_400,
        bip30_exceptions: parse_checkpoints(&[
            (
                91_842,
                "00000000000a4d0a398161ffc163c503763b1f4360639393e0e4c8e300e0caec",
            ),
            (
                91_880,
                "00000000000743f190a18c5577a3c2d2a1f610ae9601ac046a38084ccb7cd721",
            ),
        ]),
        checkpoints: parse_checkpoints(&[
            (
                11_111,
                "0000000069e244f73d78e8fd29ba2fd2ed618bd6fa2ee92559f542fdb26e7c1d",
            ),
            (
                33_333,
                "000000002dd5588a74784eaa7ab0507a18ad16a236e7b1ce69f00d7ddfb5d0a6",
            ),
            (
                74_000,
                "0000000000573993a3c9e41ce34471c079dcf5f52a0e824a81e7f953b8661a20",
            ),
            (
                105_000,
                "00000000000291ce28027faea320c8d2b054b2e0fe44a773f3eefb151d6bdc97",
            ),
        ]),
        pow_limit: hash("00000000ffffffffffffffffffffffffffffffffffffffffffffffffffffffff"),
        pow_target_timespan: 14 * 24 * 60 * 60,
        pow_target_spacing: 10 * 60,
        pow_no_retargeting: false,
    }
}

fn testnet_consensus_params() -> ConsensusParams {
    ConsensusParams {
        network: Network::Testnet,
        genesis: Genesis {
            hash: hash("000000000933ea01ad0ee984209779baaec3ced90fa3f408719526f8d77f4943"),
            version: 1,
            merkle_root: hash(GENESIS_MERKLE_ROOT),
            time: 1_296_688_602,
            bits: 0x1d00_ffff,
            nonce: 414_098_458,
        },
        subsidy_halving_interval: 210_000,
        majority_reject_block_outdated: 75,
        majority_window: 100,
        bip16_switch_time: 1_329_264_000,
        bip30_exceptions: Vec::new(),
        checkpoints: parse_checkpoints(&[(
            546,
            "000000002a936ca763904c3c35fce2f3556c559c0214345d31b1bcebf76acb70",
        )]),
        pow_limit: hash("00000000ffffffffffffffffffffffffffffffffffffffffffffffffffffffff"),
        pow_target_timespan: 14 * 24 * 60 * 60,
        pow_target_spacing: 10 * 60,
        pow_no_retargeting: false,
    }
}

fn regtest_consensus_params() -> ConsensusParams {
    ConsensusParams {
        network: Network::Regtest,
        genesis: Genesis {
            hash: hash("0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206"),
            version: 1,
            merkle_root: hash(GENESIS_MERKLE_ROOT),
            time: 1_296_688_602,
            bits: 0x207f_ffff,
            nonce: 2,
        },
        subsidy_halving_interval: 150,
        majority_reject_block_outdated: 950,
        majority_window: 1_000,
        bip16_switch_time: 0,
        bip30_exceptions: Vec::new(),
        checkpoints: Vec::new(),
        pow_limit: hash("7fffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff"),
        pow_target_timespan: 14 * 24 * 60 * 60,
        pow_target_spacing: 10 * 60,
        pow_no_retargeting: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mainnet_params() {
        let params = consensus_params(Network::Mainnet);
        assert_eq!(params.retarget_interval(), 2016);
        assert_eq!(params.subsidy_halving_interval, 210_000);
        assert_eq!(params.majority_window, 1_000);
        assert_eq!(params.majority_reject_block_outdated, 950);
        assert_eq!(params.bip30_exceptions.len(), 2);
        assert_eq!(
            hash256_to_hex(&params.pow_limit),
            "00000000ffffffffffffffffffffffffffffffffffffffffffffffffffffffff"
        );
        assert!(params.checkpoint_at(11_111).is_some());
        assert!(params.checkpoint_at(11_112).is_none());
    }

    #[test]
    fn regtest_has_no_exceptions() {
        let params = consensus_params(Network::Regtest);
        assert!(params.bip30_exceptions.is_empty());
        assert!(params.pow_no_retargeting);
        assert_eq!(params.genesis.bits, 0x207f_ffff);
    }

    #[test]
    fn hex_roundtrip_and_padding() {
        let hex = "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f";
        let parsed = hash256_from_hex(hex).expect("parse");
        assert_eq!(parsed[31], 0);
        assert_eq!(parsed[0], 0x6f);
        assert_eq!(hash256_to_hex(&parsed), hex);

        let short = hash256_from_hex("0x1").expect("short");
        assert_eq!(short[0], 1);
        assert!(short[1..].iter().all(|b| *b == 0));

        assert_eq!(hash256_from_hex(""), Err(HexError::InvalidLength));
        assert_eq!(hash256_from_hex("zz"), Err(HexError::InvalidHex));
    }

    #[test]
    fn network_names() {
        assert_eq!(Network::parse("main"), Some(Network::Mainnet));
        assert_eq!(Network::parse("REGTEST"), Some(Network::Regtest));
        assert_eq!(Network::parse("signet"), None);
        assert_eq!(Network::Testnet.as_str(), "testnet");
    }
}
