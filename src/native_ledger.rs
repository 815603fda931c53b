//! Ledger ICX app over an APDU transport.
//!
//! The transport is opened lazily on the first call, reused while it is healthy,
//! and dropped after any transport error (or an abandoned call) so the next
//! request reopens it. An abandoned exchange keeps its own handle on the
//! blocking pool until the device answers.

use crate::device::{AppVersion, SigningDevice};
use crate::error::DeviceError;
use crate::signer::{TxDigest, SIGNATURE_LEN};
use crate::types::{DerivationPath, IcxAddress};
use async_trait::async_trait;
use ledger_transport::{APDUAnswer, APDUCommand, Exchange};
use std::fmt;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::Mutex;
use tokio::task;
use tracing::{debug, error, info, warn};

pub const CLA: u8 = 0xE0;
const INS_GET_ADDRESS: u8 = 0x02;
const INS_SIGN: u8 = 0x04;
const INS_GET_APP_CONFIGURATION: u8 = 0x06;

const P1_NO_CONFIRM: u8 = 0x00;
const P1_CONFIRM: u8 = 0x01;
const P1_FIRST_CHUNK: u8 = 0x00;
const P1_MORE_CHUNKS: u8 = 0x80;
const P2_RETURN_CHAIN_CODE: u8 = 0x01;

/// Maximum APDU payload the ICX app accepts per sign chunk.
pub const CHUNK_SIZE: usize = 150;

const HASH_LEN: usize = 32;

const SW_OK: u16 = 0x9000;
const SW_USER_REJECTED: u16 = 0x6985;
const SW_INVALID_DATA: [u16; 2] = [0x6a80, 0x6a84];
const SW_LOCKED: [u16; 2] = [0x6982, 0x5515];
const SW_APP_NOT_OPEN: [u16; 4] = [0x6d00, 0x6e00, 0x6e01, 0x6511];

/// Opens a fresh transport to the device.
pub type Connector<T> = Box<dyn Fn() -> Result<T, DeviceError> + Send + Sync>;

pub struct LedgerIcx<T> {
    connect: Connector<T>,
    transport: Mutex<Option<Arc<T>>>,
}

impl<T> LedgerIcx<T>
where
    T: Exchange + Send + Sync + 'static,
    T::Error: fmt::Display + Send + 'static,
    T::AnswerType: Send + 'static,
{
    pub fn new(connect: Connector<T>) -> Self {
        Self {
            connect,
            transport: Mutex::new(None),
        }
    }

    /// One APDU round trip. HID reads block until the device answers, so the
    /// exchange runs on the blocking pool and this future stays cancellable.
    async fn exchange(&self, command: APDUCommand<Vec<u8>>) -> Result<APDUAnswer<T::AnswerType>, DeviceError> {
        let mut guard = self.transport.lock().await;
        let transport = match guard.as_ref() {
            Some(transport) => Arc::clone(transport),
            None => {
                let transport = Arc::new((self.connect)()?);
                info!("Opened Ledger transport");
                *guard = Some(Arc::clone(&transport));
                transport
            }
        };

        debug!("APDU ins={:#04x} p1={:#04x} len={}", command.ins, command.p1, command.data.len());
        let runtime = Handle::current();
        let result = task::spawn_blocking(move || runtime.block_on(transport.exchange(&command)))
            .await
            .map_err(|e| e.to_string())
            .and_then(|answer| answer.map_err(|e| e.to_string()));
        match result {
            Ok(answer) => Ok(answer),
            Err(message) => {
                *guard = None;
                error!("Ledger transport error: {}", message);
                Err(classify_transport_error(&message))
            }
        }
    }
}

#[async_trait]
impl<T> SigningDevice for LedgerIcx<T>
where
    T: Exchange + Send + Sync + 'static,
    T::Error: fmt::Display + Send + 'static,
    T::AnswerType: Send + 'static,
{
    async fn derive_address(&self, path: &DerivationPath, confirm: bool) -> Result<IcxAddress, DeviceError> {
        let command = APDUCommand {
            cla: CLA,
            ins: INS_GET_ADDRESS,
            p1: if confirm { P1_CONFIRM } else { P1_NO_CONFIRM },
            p2: P2_RETURN_CHAIN_CODE,
            data: path.to_bytes(),
        };
        let answer = self.exchange(command).await?;
        check_status_word(answer.retcode(), false)?;
        parse_address_response(answer.data())
    }

    async fn sign_digest(&self, path: &DerivationPath, digest: &TxDigest) -> Result<Vec<u8>, DeviceError> {
        let chunks = sign_chunks(path, digest.preimage());
        let total = chunks.len();
        let mut last_answer = None;
        for (i, chunk) in chunks.into_iter().enumerate() {
            let command = APDUCommand {
                cla: CLA,
                ins: INS_SIGN,
                p1: if i == 0 { P1_FIRST_CHUNK } else { P1_MORE_CHUNKS },
                p2: 0x00,
                data: chunk,
            };
            debug!("Sending sign chunk {}/{}", i + 1, total);
            let answer = self.exchange(command).await?;
            check_status_word(answer.retcode(), true)?;
            last_answer = Some(answer);
        }
        let answer = last_answer.ok_or_else(|| DeviceError::MalformedResponse("no sign chunks sent".into()))?;
        parse_sign_response(answer.data(), digest)
    }

    async fn app_version(&self) -> Result<AppVersion, DeviceError> {
        let command = APDUCommand {
            cla: CLA,
            ins: INS_GET_APP_CONFIGURATION,
            p1: 0x00,
            p2: 0x00,
            data: Vec::new(),
        };
        let answer = self.exchange(command).await?;
        check_status_word(answer.retcode(), false)?;
        match answer.data() {
            [major, minor, patch, ..] => Ok(AppVersion {
                major: *major,
                minor: *minor,
                patch: *patch,
            }),
            other => Err(DeviceError::MalformedResponse(format!(
                "app configuration is {} bytes",
                other.len()
            ))),
        }
    }

    async fn reset(&self) {
        if self.transport.lock().await.take().is_some() {
            warn!("Dropped Ledger transport; it will be reopened on the next call");
        }
    }
}

#[cfg(feature = "hid")]
pub type HidLedgerIcx = LedgerIcx<ledger_transport_hid::TransportNativeHID>;

#[cfg(feature = "hid")]
impl LedgerIcx<ledger_transport_hid::TransportNativeHID> {
    /// Ledger on the first HID device found.
    pub fn hid() -> Self {
        use ledger_transport_hid::{hidapi::HidApi, TransportNativeHID};

        Self::new(Box::new(|| {
            let api = HidApi::new().map_err(|e| classify_transport_error(&e.to_string()))?;
            TransportNativeHID::new(&api).map_err(|e| classify_transport_error(&e.to_string()))
        }))
    }
}

/// Split the preimage into sign APDU payloads.
///
/// The first payload carries the path and the 4-byte big-endian preimage length
/// ahead of the data; the rest carry data only.
pub fn sign_chunks(path: &DerivationPath, preimage: &[u8]) -> Vec<Vec<u8>> {
    let mut header = path.to_bytes();
    header.extend_from_slice(&(preimage.len() as u32).to_be_bytes());

    let first_len = preimage.len().min(CHUNK_SIZE - header.len());
    let (first, rest) = preimage.split_at(first_len);

    let mut chunks = Vec::with_capacity(1 + rest.len() / CHUNK_SIZE + 1);
    header.extend_from_slice(first);
    chunks.push(header);
    chunks.extend(rest.chunks(CHUNK_SIZE).map(<[u8]>::to_vec));
    chunks
}

/// `[pk_len][pk][addr_len][address ascii][chain code]`
pub fn parse_address_response(data: &[u8]) -> Result<IcxAddress, DeviceError> {
    let malformed = |what: &str| DeviceError::MalformedResponse(format!("address response: {}", what));

    let pk_len = *data.first().ok_or_else(|| malformed("empty"))? as usize;
    let addr_len = *data.get(1 + pk_len).ok_or_else(|| malformed("truncated public key"))? as usize;
    let start = 2 + pk_len;
    let raw = data
        .get(start..start + addr_len)
        .ok_or_else(|| malformed("truncated address"))?;
    let text = std::str::from_utf8(raw).map_err(|_| malformed("address is not ascii"))?;
    text.parse().map_err(|e: String| malformed(&e))
}

/// `[signature (65)][hash computed by the device (32)]`
fn parse_sign_response(data: &[u8], digest: &TxDigest) -> Result<Vec<u8>, DeviceError> {
    if data.len() < SIGNATURE_LEN + HASH_LEN {
        return Err(DeviceError::MalformedResponse(format!(
            "sign response is {} bytes, expected {}",
            data.len(),
            SIGNATURE_LEN + HASH_LEN
        )));
    }
    let (signature, rest) = data.split_at(SIGNATURE_LEN);
    let device_hash = &rest[..HASH_LEN];
    if device_hash != digest.as_bytes() {
        return Err(DeviceError::InvalidDigest(format!(
            "device hashed {} but expected {}",
            hex::encode(device_hash),
            digest.to_hex()
        )));
    }
    Ok(signature.to_vec())
}

pub fn check_status_word(sw: u16, signing: bool) -> Result<(), DeviceError> {
    match sw {
        SW_OK => Ok(()),
        SW_USER_REJECTED => Err(DeviceError::Rejected),
        sw if signing && SW_INVALID_DATA.contains(&sw) => Err(DeviceError::InvalidDigest(format!(
            "device refused the transaction data (0x{:04x})",
            sw
        ))),
        sw if SW_LOCKED.contains(&sw) => Err(DeviceError::Unavailable("device is locked".into())),
        sw if SW_APP_NOT_OPEN.contains(&sw) => Err(DeviceError::Unavailable("ICX app is not open".into())),
        sw => Err(DeviceError::Unavailable(format!("unexpected status word 0x{:04x}", sw))),
    }
}

fn is_locked_error(lower: &str) -> bool {
    lower.contains("locked") || lower.contains("6982") || lower.contains("5515") || lower.contains("not open")
}

fn is_disconnected_error(lower: &str) -> bool {
    lower.contains("device not found")
        || lower.contains("no device")
        || lower.contains("not connected")
        || lower.contains("hidapi")
}

/// Map a transport failure message onto the device taxonomy.
pub fn classify_transport_error(message: &str) -> DeviceError {
    let lower = message.to_lowercase();
    if lower.contains("denied") || lower.contains("rejected") || lower.contains("6985") {
        DeviceError::Rejected
    } else if is_locked_error(&lower) {
        DeviceError::Unavailable("device is locked".into())
    } else if is_disconnected_error(&lower) {
        DeviceError::Unavailable(format!("Ledger not connected ({})", message))
    } else {
        DeviceError::Unavailable(message.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceSession;
    use crate::types::ICX_COIN_TYPE;
    use std::collections::VecDeque;
    use std::ops::Deref;
    use std::sync::{Arc, Mutex as StdMutex};
    use std::time::{Duration, Instant};

    const ADDRESS: &str = "hx0123456789abcdef0123456789abcdef01234567";

    #[derive(Debug, thiserror::Error)]
    #[error("{0}")]
    struct ScriptError(String);

    #[derive(Default)]
    struct Script {
        answers: VecDeque<Result<Vec<u8>, String>>,
        sent: Vec<(u8, u8, u8, u8, Vec<u8>)>,
        connects: usize,
        stall: Option<Duration>,
    }

    #[derive(Clone, Default)]
    struct ScriptedTransport(Arc<StdMutex<Script>>);

    impl ScriptedTransport {
        fn answer(&self, data: &[u8], sw: u16) {
            let mut bytes = data.to_vec();
            bytes.extend_from_slice(&sw.to_be_bytes());
            self.0.lock().unwrap().answers.push_back(Ok(bytes));
        }

        fn fail(&self, message: &str) {
            self.0.lock().unwrap().answers.push_back(Err(message.to_string()));
        }

        /// Block the thread on the next exchange, the way a HID read waits for the user.
        fn stall_next(&self, duration: Duration) {
            self.0.lock().unwrap().stall = Some(duration);
        }

        fn sent(&self) -> Vec<(u8, u8, u8, u8, Vec<u8>)> {
            self.0.lock().unwrap().sent.clone()
        }

        fn connects(&self) -> usize {
            self.0.lock().unwrap().connects
        }

        fn device(&self) -> LedgerIcx<ScriptedTransport> {
            let transport = self.clone();
            LedgerIcx::new(Box::new(move || {
                transport.0.lock().unwrap().connects += 1;
                Ok(transport.clone())
            }))
        }
    }

    #[async_trait]
    impl Exchange for ScriptedTransport {
        type Error = ScriptError;
        type AnswerType = Vec<u8>;

        async fn exchange<I>(&self, command: &APDUCommand<I>) -> Result<APDUAnswer<Vec<u8>>, ScriptError>
        where
            I: Deref<Target = [u8]> + Send + Sync,
        {
            let stall = self.0.lock().unwrap().stall.take();
            if let Some(duration) = stall {
                std::thread::sleep(duration);
            }
            let mut script = self.0.lock().unwrap();
            script
                .sent
                .push((command.cla, command.ins, command.p1, command.p2, command.data.to_vec()));
            match script.answers.pop_front() {
                Some(Ok(bytes)) => Ok(APDUAnswer::from_answer(bytes).unwrap()),
                Some(Err(message)) => Err(ScriptError(message)),
                None => Err(ScriptError("script exhausted".into())),
            }
        }
    }

    fn path(index: u32) -> DerivationPath {
        DerivationPath::for_index(ICX_COIN_TYPE, index).unwrap()
    }

    fn address_response() -> Vec<u8> {
        let mut data = vec![65];
        data.extend_from_slice(&[0x04; 65]);
        data.push(ADDRESS.len() as u8);
        data.extend_from_slice(ADDRESS.as_bytes());
        data.extend_from_slice(&[0xcc; 32]);
        data
    }

    fn sign_response(digest: &TxDigest) -> Vec<u8> {
        let mut data = vec![0x11; SIGNATURE_LEN];
        data.extend_from_slice(digest.as_bytes());
        data
    }

    #[test]
    fn test_sign_chunks_short_preimage() {
        let chunks = sign_chunks(&path(0), b"icx_sendTransaction.a.1");
        assert_eq!(chunks.len(), 1);
        let first = &chunks[0];
        assert_eq!(first[0], 5);
        assert_eq!(&first[21..25], &23u32.to_be_bytes());
        assert_eq!(&first[25..], b"icx_sendTransaction.a.1");
    }

    #[test]
    fn test_sign_chunks_long_preimage() {
        let preimage: Vec<u8> = (0..400u32).map(|i| (i % 251) as u8).collect();
        let chunks = sign_chunks(&path(3), &preimage);
        // 125 bytes ride with the header, then 150 + 125
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), CHUNK_SIZE);
        assert_eq!(chunks[1].len(), CHUNK_SIZE);
        assert_eq!(chunks[2].len(), 125);
        let mut rebuilt = chunks[0][25..].to_vec();
        rebuilt.extend(chunks[1].iter().chain(chunks[2].iter()));
        assert_eq!(rebuilt, preimage);
    }

    #[test]
    fn test_parse_address_response() {
        let address = parse_address_response(&address_response()).unwrap();
        assert_eq!(address.as_str(), ADDRESS);
        assert!(matches!(
            parse_address_response(&[65, 0x04]),
            Err(DeviceError::MalformedResponse(_))
        ));
        assert!(parse_address_response(&[]).is_err());
    }

    #[test]
    fn test_status_word_mapping() {
        assert!(check_status_word(0x9000, true).is_ok());
        assert_eq!(check_status_word(0x6985, true), Err(DeviceError::Rejected));
        assert!(matches!(check_status_word(0x6a80, true), Err(DeviceError::InvalidDigest(_))));
        assert!(matches!(check_status_word(0x6a80, false), Err(DeviceError::Unavailable(_))));
        assert_eq!(
            check_status_word(0x6982, false),
            Err(DeviceError::Unavailable("device is locked".into()))
        );
        assert_eq!(
            check_status_word(0x6e00, false),
            Err(DeviceError::Unavailable("ICX app is not open".into()))
        );
    }

    #[test]
    fn test_classify_transport_error() {
        assert_eq!(classify_transport_error("Ledger device not found"), DeviceError::Unavailable("Ledger not connected (Ledger device not found)".into()));
        assert_eq!(classify_transport_error("Request denied by user"), DeviceError::Rejected);
        assert_eq!(classify_transport_error("Device is locked"), DeviceError::Unavailable("device is locked".into()));
    }

    #[tokio::test]
    async fn test_derive_address_apdu() {
        let transport = ScriptedTransport::default();
        transport.answer(&address_response(), 0x9000);
        let device = transport.device();

        let address = device.derive_address(&path(2), true).await.unwrap();
        assert_eq!(address.as_str(), ADDRESS);

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        let (cla, ins, p1, p2, data) = &sent[0];
        assert_eq!((*cla, *ins, *p1, *p2), (0xE0, 0x02, 0x01, 0x01));
        assert_eq!(data, &path(2).to_bytes());
    }

    #[tokio::test]
    async fn test_sign_streams_preimage_and_checks_hash() {
        let digest = TxDigest::compute(vec![b'x'; 200]);
        let transport = ScriptedTransport::default();
        transport.answer(&[], 0x9000);
        transport.answer(&sign_response(&digest), 0x9000);
        let device = transport.device();

        let signature = device.sign_digest(&path(0), &digest).await.unwrap();
        assert_eq!(signature, vec![0x11; SIGNATURE_LEN]);

        let sent = transport.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!((sent[0].1, sent[0].2), (0x04, 0x00));
        assert_eq!((sent[1].1, sent[1].2), (0x04, 0x80));
        assert_eq!(transport.connects(), 1);
    }

    #[tokio::test]
    async fn test_sign_hash_mismatch_is_invalid_digest() {
        let digest = TxDigest::compute(b"icx_sendTransaction.a.1".to_vec());
        let other = TxDigest::compute(b"icx_sendTransaction.a.2".to_vec());
        let transport = ScriptedTransport::default();
        transport.answer(&sign_response(&other), 0x9000);

        let err = transport.device().sign_digest(&path(0), &digest).await.unwrap_err();
        assert!(matches!(err, DeviceError::InvalidDigest(_)));
    }

    #[tokio::test]
    async fn test_user_rejection_stops_streaming() {
        let digest = TxDigest::compute(vec![b'x'; 400]);
        let transport = ScriptedTransport::default();
        transport.answer(&[], 0x6985);

        let err = transport.device().sign_digest(&path(0), &digest).await.unwrap_err();
        assert_eq!(err, DeviceError::Rejected);
        assert_eq!(transport.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_transport_error_reopens_channel() {
        let transport = ScriptedTransport::default();
        transport.fail("hidapi error: device disconnected");
        transport.answer(&address_response(), 0x9000);
        let device = transport.device();

        let err = device.derive_address(&path(0), false).await.unwrap_err();
        assert!(matches!(err, DeviceError::Unavailable(_)));
        assert!(device.derive_address(&path(0), false).await.is_ok());
        assert_eq!(transport.connects(), 2);
    }

    #[tokio::test]
    async fn test_app_version() {
        let transport = ScriptedTransport::default();
        transport.answer(&[0x00, 0x01, 0x02], 0x9000);
        let version = transport.device().app_version().await.unwrap();
        assert_eq!(version, AppVersion { major: 0, minor: 1, patch: 2 });
    }

    #[tokio::test]
    async fn test_works_behind_device_session() {
        let transport = ScriptedTransport::default();
        transport.answer(&address_response(), 0x9000);
        let session = DeviceSession::new(Box::new(transport.device()), ICX_COIN_TYPE, Duration::from_secs(5));

        let address = session.derive_address(&path(4), false).await.unwrap();
        assert_eq!(session.bound_address(&path(4)).await, Some(address));
    }

    #[tokio::test]
    async fn test_blocked_exchange_times_out_and_frees_device() {
        let transport = ScriptedTransport::default();
        transport.stall_next(Duration::from_millis(600));
        transport.answer(&address_response(), 0x9000);
        transport.answer(&address_response(), 0x9000);
        let timeout = Duration::from_millis(50);
        let session = DeviceSession::new(Box::new(transport.device()), ICX_COIN_TYPE, timeout);

        let started = Instant::now();
        let err = session.derive_address(&path(0), false).await.unwrap_err();
        assert_eq!(err, DeviceError::Timeout(timeout));
        assert!(started.elapsed() < Duration::from_millis(400), "took {:?}", started.elapsed());

        // Lock released and channel reopened while the stalled read is still pending
        let address = session.derive_address(&path(1), false).await.unwrap();
        assert_eq!(address.as_str(), ADDRESS);
        assert_eq!(transport.connects(), 2);
    }
}
