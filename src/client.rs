use crate::config::Tuning;
use crate::message::{
    chunk_count, AckTarget, ChunkPayload, Message, NakReason, NameTag, CRC32C, MAX_PAYLOAD,
};
use crate::packet::{decode, encode, WireError, EXTENDED_SIZE};
use crate::session::Bitmap;
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Erreurs d'un transfert côté client
#[derive(Error, Debug)]
pub enum TransferError {
    /// Aucune réponse au Start ou au Query : panne de connectivité, le lot
    /// entier est abandonné
    #[error("no response from server after {0} attempts")]
    Unreachable(u32),

    #[error("no acknowledgement for End after {0} attempts")]
    EndTimeout(u32),

    #[error("chunk {index} unacknowledged after {attempts} sends")]
    ChunkTimeout { index: u32, attempts: u32 },

    #[error("server still missing chunks after {0} resend rounds")]
    ResendStalled(u32),

    #[error("server reports checksum mismatch")]
    ChecksumFailed,

    /// Le serveur a perdu la session (redémarrage, timeout d'inactivité)
    #[error("server lost the session")]
    SessionLost,

    #[error("server rejected the transfer ({0:?})")]
    Rejected(NakReason),

    #[error("file too large for 32-bit chunk indexing")]
    TooLarge,

    #[error("interrupted")]
    Interrupted,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Source de chunks : fichier à accès positionné, ou tampon mémoire pour
/// stdin. Le CRC32C du flux complet est calculé en une passe à l'ouverture.
pub struct ChunkSource {
    backing: Backing,
    size: u64,
    checksum: u32,
}

enum Backing {
    File(File),
    Memory(Vec<u8>),
}

impl ChunkSource {
    pub fn from_file(path: &Path) -> io::Result<Self> {
        let mut file = File::open(path)?;
        let size = file.metadata()?.len();

        // Une passe de lecture pour le digest, puis retour au début
        let mut digest = CRC32C.digest();
        let mut buf = [0u8; 8192];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            digest.update(&buf[..n]);
        }
        file.seek(SeekFrom::Start(0))?;

        Ok(ChunkSource {
            backing: Backing::File(file),
            size,
            checksum: digest.finalize(),
        })
    }

    pub fn from_bytes(data: Vec<u8>) -> Self {
        let checksum = crate::message::crc32c(&data);
        ChunkSource {
            size: data.len() as u64,
            checksum,
            backing: Backing::Memory(data),
        }
    }

    pub fn len(&self) -> u64 {
        self.size
    }

    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    /// Relit le chunk `index` ; le dernier chunk peut être plus court que
    /// MAX_PAYLOAD
    pub fn read_chunk<'a>(
        &mut self,
        index: u32,
        buf: &'a mut [u8; MAX_PAYLOAD],
    ) -> io::Result<&'a [u8]> {
        let offset = index as u64 * MAX_PAYLOAD as u64;
        let len = (self.size - offset).min(MAX_PAYLOAD as u64) as usize;
        match &mut self.backing {
            Backing::File(file) => {
                file.seek(SeekFrom::Start(offset))?;
                file.read_exact(&mut buf[..len])?;
            }
            Backing::Memory(data) => {
                buf[..len].copy_from_slice(&data[offset as usize..offset as usize + len]);
            }
        }
        Ok(&buf[..len])
    }
}

/// Nom attribué à un flux lu sur stdin
fn stdin_name() -> String {
    let epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format!("stdin-{}", epoch)
}

/// Réponse d'un serveur à un Start, End ou Query
enum ControlReply {
    Acked,
    Refused(NakReason),
}

/// Chunk en vol : dernier envoi et nombre de tentatives
struct Flight {
    index: u32,
    last_send: Instant,
    attempts: u32,
}

/// Moteur client : segmente une source en chunks de 16 octets et déroule
/// Start, la fenêtre glissante de Data, puis End, avec réémissions à
/// backoff exponentiel. Une seule session à la fois ; mono-thread, les
/// seuls points de suspension sont la réception socket et la pause de
/// cadencement.
pub struct ClientEngine {
    socket: UdpSocket,
    magic: u32,
    tuning: Tuning,
    next_transfer_id: u32,
    last_send: Option<Instant>,
    /// Tags déjà émis dans ce lot, pour la règle de collision de troncature
    used_names: HashMap<NameTag, String>,
    shutdown: Arc<AtomicBool>,
}

impl ClientEngine {
    pub fn new(
        peer: SocketAddr,
        magic: u32,
        tuning: Tuning,
        shutdown: Arc<AtomicBool>,
    ) -> io::Result<Self> {
        let bind = match peer {
            SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        };
        let socket = UdpSocket::bind(bind)?;
        socket.connect(peer)?;

        // Compteur monotone semé aléatoirement : un client relancé ne
        // retombe pas sur les identifiants d'une session que le serveur
        // garde encore vivante
        let mut next_transfer_id = rand::random::<u32>();
        if next_transfer_id == 0 {
            next_transfer_id = 1;
        }

        Ok(ClientEngine {
            socket,
            magic,
            tuning,
            next_transfer_id,
            last_send: None,
            used_names: HashMap::new(),
            shutdown,
        })
    }

    /// Identifiant du prochain transfert, jamais nul
    fn alloc_transfer_id(&mut self) -> u32 {
        let id = self.next_transfer_id;
        self.next_transfer_id = match self.next_transfer_id.wrapping_add(1) {
            0 => 1,
            n => n,
        };
        id
    }

    /// Sonde le serveur et retourne (version de protocole, capacités)
    pub fn query(&mut self) -> Result<(u32, u32), TransferError> {
        for attempt in 0..self.tuning.handshake_retries {
            if self.shutdown.load(Ordering::Relaxed) {
                return Err(TransferError::Interrupted);
            }
            self.transmit(&Message::Query)?;
            let deadline = Instant::now() + self.backoff(attempt);
            while let Some(reply) = self.await_reply(deadline)? {
                if let Message::QueryReply { version, caps } = reply {
                    return Ok((version, caps));
                }
            }
        }
        Err(TransferError::Unreachable(self.tuning.handshake_retries))
    }

    pub fn send_file(&mut self, path: &Path) -> Result<(), TransferError> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed".to_string());
        let mut source = ChunkSource::from_file(path)?;
        let filename = self.wire_name(&name);
        info!(
            "sending \"{}\" as \"{}\" ({} bytes)",
            name,
            filename.decoded(),
            source.len()
        );
        self.send_source(&mut source, filename)
    }

    /// Transfert d'un flux lu sur stdin, sous le nom `stdin-<epoch>`
    pub fn send_stdin(&mut self) -> Result<(), TransferError> {
        let mut data = Vec::new();
        io::stdin().lock().read_to_end(&mut data)?;
        self.send_stream(data)
    }

    /// Transfert d'un tampon déjà lu en mémoire, sous le nom `stdin-<epoch>`
    pub fn send_stream(&mut self, data: Vec<u8>) -> Result<(), TransferError> {
        let name = stdin_name();
        let mut source = ChunkSource::from_bytes(data);
        let filename = self.wire_name(&name);
        info!("sending stdin as \"{}\" ({} bytes)", name, source.len());
        self.send_source(&mut source, filename)
    }

    fn send_source(
        &mut self,
        source: &mut ChunkSource,
        filename: NameTag,
    ) -> Result<(), TransferError> {
        let total_size = source.len();
        let total_chunks = chunk_count(total_size).ok_or(TransferError::TooLarge)?;
        let checksum = source.checksum();

        // Un seul redémarrage si le serveur perd la session en route
        for attempt in 0..2 {
            let transfer_id = self.alloc_transfer_id();
            match self.run_transfer(transfer_id, source, filename, total_size, total_chunks, checksum)
            {
                Err(TransferError::SessionLost) if attempt == 0 => {
                    warn!("server lost the session, restarting transfer from Start");
                }
                other => return other,
            }
        }
        Err(TransferError::SessionLost)
    }

    fn run_transfer(
        &mut self,
        transfer_id: u32,
        source: &mut ChunkSource,
        filename: NameTag,
        total_size: u64,
        total_chunks: u32,
        checksum: u32,
    ) -> Result<(), TransferError> {
        let start = Message::Start {
            transfer_id,
            total_size,
            filename,
        };
        match self.control_handshake(&start, transfer_id, AckTarget::Start)? {
            ControlReply::Acked => debug!("start acknowledged (transfer {:#010x})", transfer_id),
            ControlReply::Refused(reason) => return Err(TransferError::Rejected(reason)),
        }

        let mut acked = Bitmap::new(total_chunks);
        self.data_phase(transfer_id, source, &mut acked, total_chunks)?;

        let end = Message::End {
            transfer_id,
            total_chunks,
            checksum,
        };
        let mut rounds = 0u32;
        loop {
            let reply = match self.control_handshake(&end, transfer_id, AckTarget::End) {
                Err(TransferError::Unreachable(n)) => return Err(TransferError::EndTimeout(n)),
                other => other?,
            };
            match reply {
                ControlReply::Acked => {
                    info!("transfer {:#010x} complete", transfer_id);
                    return Ok(());
                }
                ControlReply::Refused(NakReason::MissingChunks(first)) => {
                    rounds += 1;
                    if rounds > self.tuning.handshake_retries {
                        return Err(TransferError::ResendStalled(rounds));
                    }
                    warn!("server missing chunks from index {}, resending", first);
                    // Les acquittements au-delà du trou ne sont plus fiables :
                    // tout est rejoué à partir du premier index manquant
                    let mut acked = Bitmap::new(total_chunks);
                    for i in 0..first.min(total_chunks) {
                        acked.set(i);
                    }
                    self.data_phase(transfer_id, source, &mut acked, total_chunks)?;
                }
                ControlReply::Refused(NakReason::ChecksumFailed) => {
                    return Err(TransferError::ChecksumFailed)
                }
                ControlReply::Refused(NakReason::NoSession) => {
                    return Err(TransferError::SessionLost)
                }
                ControlReply::Refused(reason) => return Err(TransferError::Rejected(reason)),
            }
        }
    }

    /// Fenêtre glissante de Data : envoie tout chunk non acquitté, réémet
    /// à échéance de backoff, et abandonne le fichier quand un chunk épuise
    /// ses tentatives
    fn data_phase(
        &mut self,
        transfer_id: u32,
        source: &mut ChunkSource,
        acked: &mut Bitmap,
        total_chunks: u32,
    ) -> Result<(), TransferError> {
        let mut inflight: Vec<Flight> = Vec::new();
        let mut next: u32 = 0;
        let mut buf = [0u8; MAX_PAYLOAD];

        while !acked.is_full() {
            if self.shutdown.load(Ordering::Relaxed) {
                return Err(TransferError::Interrupted);
            }

            // Remplir la fenêtre
            while inflight.len() < self.tuning.window && next < total_chunks {
                if acked.get(next) {
                    next += 1;
                    continue;
                }
                let chunk = source.read_chunk(next, &mut buf)?;
                self.transmit(&Message::Data {
                    transfer_id,
                    index: next,
                    payload: ChunkPayload::new(chunk),
                })?;
                inflight.push(Flight {
                    index: next,
                    last_send: Instant::now(),
                    attempts: 1,
                });
                next += 1;
            }

            // Réémissions échues
            let now = Instant::now();
            for i in 0..inflight.len() {
                let due = inflight[i].last_send + self.backoff(inflight[i].attempts - 1);
                if now < due {
                    continue;
                }
                if inflight[i].attempts > self.tuning.per_chunk_retries {
                    return Err(TransferError::ChunkTimeout {
                        index: inflight[i].index,
                        attempts: inflight[i].attempts,
                    });
                }
                let index = inflight[i].index;
                let chunk = source.read_chunk(index, &mut buf)?;
                self.transmit(&Message::Data {
                    transfer_id,
                    index,
                    payload: ChunkPayload::new(chunk),
                })?;
                inflight[i].last_send = Instant::now();
                inflight[i].attempts += 1;
            }

            // Dormir jusqu'à la plus proche échéance de réémission
            let now = Instant::now();
            let wait = inflight
                .iter()
                .map(|f| {
                    (f.last_send + self.backoff(f.attempts - 1)).saturating_duration_since(now)
                })
                .min()
                .unwrap_or(self.tuning.rtt_base);

            match self.await_reply(now + wait)? {
                Some(Message::Ack {
                    transfer_id: t,
                    target: AckTarget::Chunk(index),
                }) if t == transfer_id => {
                    if index < total_chunks && !acked.get(index) {
                        acked.set(index);
                        if let Some(pos) = inflight.iter().position(|f| f.index == index) {
                            inflight.swap_remove(pos);
                        }
                    }
                }
                Some(Message::Nak {
                    transfer_id: t,
                    target: AckTarget::Chunk(index),
                    reason,
                }) if t == transfer_id => match reason {
                    NakReason::NoSession => return Err(TransferError::SessionLost),
                    NakReason::FieldOutOfRange => {
                        return Err(TransferError::Rejected(reason));
                    }
                    _ => {
                        // Réémission immédiate demandée ; ne consomme ni la
                        // fenêtre ni le budget de tentatives
                        if let Some(pos) = inflight.iter().position(|f| f.index == index) {
                            let chunk = source.read_chunk(index, &mut buf)?;
                            self.transmit(&Message::Data {
                                transfer_id,
                                index,
                                payload: ChunkPayload::new(chunk),
                            })?;
                            inflight[pos].last_send = Instant::now();
                        }
                    }
                },
                // Réponses périmées d'une phase précédente, ou rien
                Some(_) | None => {}
            }
        }
        Ok(())
    }

    /// Envoie un message de contrôle et attend son Ack ou Nak, avec
    /// réémissions à backoff exponentiel
    fn control_handshake(
        &mut self,
        message: &Message,
        transfer_id: u32,
        want: AckTarget,
    ) -> Result<ControlReply, TransferError> {
        for attempt in 0..self.tuning.handshake_retries {
            if self.shutdown.load(Ordering::Relaxed) {
                return Err(TransferError::Interrupted);
            }
            self.transmit(message)?;
            let deadline = Instant::now() + self.backoff(attempt);
            while let Some(reply) = self.await_reply(deadline)? {
                match reply {
                    Message::Ack {
                        transfer_id: t,
                        target,
                    } if t == transfer_id && target.flag() == want.flag() => {
                        return Ok(ControlReply::Acked)
                    }
                    Message::Nak {
                        transfer_id: t,
                        target,
                        reason,
                    } if t == transfer_id && target.flag() == want.flag() => {
                        return Ok(ControlReply::Refused(reason))
                    }
                    // Acquittement retardataire d'un chunk ou d'une autre
                    // phase : ignoré
                    _ => {}
                }
            }
        }
        Err(TransferError::Unreachable(self.tuning.handshake_retries))
    }

    /// Délai d'attente avant la (attempt+1)-ième réémission : RTT de base
    /// doublé à chaque tentative, plafonné
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(16);
        (self.tuning.rtt_base * factor).min(self.tuning.backoff_cap)
    }

    /// Émet un datagramme en respectant l'intervalle minimal de cadencement,
    /// qui prime sur toute autre décision d'ordonnancement
    fn transmit(&mut self, message: &Message) -> io::Result<()> {
        if !self.tuning.min_interval.is_zero() {
            if let Some(last) = self.last_send {
                let elapsed = last.elapsed();
                if elapsed < self.tuning.min_interval {
                    std::thread::sleep(self.tuning.min_interval - elapsed);
                }
            }
        }
        let datagram = encode(message, self.magic);
        self.socket.send(datagram.bytes())?;
        self.last_send = Some(Instant::now());
        Ok(())
    }

    /// Attend un message du serveur jusqu'à l'échéance. Les datagrammes
    /// étrangers ou malformés sont ignorés sans être remontés.
    fn await_reply(&mut self, deadline: Instant) -> Result<Option<Message>, TransferError> {
        let mut buf = [0u8; EXTENDED_SIZE * 2];
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                return Err(TransferError::Interrupted);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            // Réveil borné pour observer le drapeau d'arrêt
            let wait = (deadline - now)
                .min(Duration::from_millis(200))
                .max(Duration::from_millis(1));
            self.socket.set_read_timeout(Some(wait))?;

            match self.socket.recv(&mut buf) {
                Ok(n) => match decode(&buf[..n], self.magic) {
                    Ok(message) => return Ok(Some(message)),
                    Err(WireError::Foreign) => debug!("foreign datagram ignored"),
                    Err(e) => debug!("malformed reply ignored: {}", e),
                },
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) => {}
                // Un port fermé remonte en ConnectionRefused sur un socket
                // connecté ; le serveur peut encore apparaître, on attend
                Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                    debug!("peer port unreachable");
                }
                Err(e) => return Err(TransferError::Io(e)),
            }
        }
    }

    /// Tag filaire d'un nom de fichier, avec la règle de collision de
    /// troncature au sein d'un même lot
    fn wire_name(&mut self, full_name: &str) -> NameTag {
        let tag = NameTag::from_name(full_name);
        match self.used_names.get(&tag) {
            None => {
                self.used_names.insert(tag, full_name.to_string());
                tag
            }
            Some(previous) if previous == full_name => tag,
            Some(_) => {
                // Deux noms distincts tronqués à l'identique : repli sur le
                // hash stable du nom complet
                let hashed = NameTag::hashed(full_name);
                self.used_names.insert(hashed, full_name.to_string());
                warn!(
                    "name \"{}\" collides after truncation, sent as \"{}\"",
                    full_name,
                    hashed.decoded()
                );
                hashed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::message::crc32c;
    use std::fs;

    fn test_engine() -> ClientEngine {
        ClientEngine::new(
            "127.0.0.1:9".parse().unwrap(),
            0xD00D_F00D,
            Config::default().tuning(),
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap()
    }

    #[test]
    fn test_chunk_source_memory() {
        let data: Vec<u8> = (0u8..33).collect();
        let mut source = ChunkSource::from_bytes(data.clone());
        assert_eq!(source.len(), 33);
        assert_eq!(source.checksum(), crc32c(&data));
        assert_eq!(chunk_count(source.len()), Some(3));

        let mut buf = [0u8; MAX_PAYLOAD];
        assert_eq!(source.read_chunk(0, &mut buf).unwrap(), &data[0..16]);
        assert_eq!(source.read_chunk(1, &mut buf).unwrap(), &data[16..32]);
        // Dernier chunk : un seul octet
        assert_eq!(source.read_chunk(2, &mut buf).unwrap(), &data[32..33]);
    }

    #[test]
    fn test_chunk_source_file() {
        let path = std::env::temp_dir().join(format!(
            "ntpspy-client-test-{}-{:08x}",
            std::process::id(),
            rand::random::<u32>()
        ));
        let data: Vec<u8> = (0u8..=255).cycle().take(16 * 4).collect();
        fs::write(&path, &data).unwrap();

        let mut source = ChunkSource::from_file(&path).unwrap();
        assert_eq!(source.len(), 64);
        assert_eq!(source.checksum(), crc32c(&data));

        // L'accès est positionné : relire un chunk déjà lu fonctionne
        let mut buf = [0u8; MAX_PAYLOAD];
        assert_eq!(source.read_chunk(3, &mut buf).unwrap(), &data[48..64]);
        assert_eq!(source.read_chunk(0, &mut buf).unwrap(), &data[0..16]);

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_empty_source() {
        let source = ChunkSource::from_bytes(Vec::new());
        assert_eq!(source.len(), 0);
        assert_eq!(chunk_count(source.len()), Some(0));
        assert_eq!(source.checksum(), 0);
    }

    #[test]
    fn test_wire_name_collision_falls_back_to_hash() {
        let mut engine = test_engine();

        // Deux noms longs distincts qui tronquent à l'identique
        let first = engine.wire_name("AAAAAAAA-one-BBBBBBB");
        let second = engine.wire_name("AAAAAAAA-two-BBBBBBB");
        assert_eq!(
            NameTag::from_name("AAAAAAAA-one-BBBBBBB"),
            NameTag::from_name("AAAAAAAA-two-BBBBBBB")
        );
        assert_ne!(first, second);
        assert_eq!(second, NameTag::hashed("AAAAAAAA-two-BBBBBBB"));

        // Le même nom ré-émis garde le même tag (le serveur renomme)
        let again = engine.wire_name("AAAAAAAA-one-BBBBBBB");
        assert_eq!(first, again);
    }

    #[test]
    fn test_stdin_name_pattern() {
        let name = stdin_name();
        let suffix = name.strip_prefix("stdin-").unwrap();
        assert!(suffix.parse::<u64>().is_ok());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let engine = test_engine();
        assert_eq!(engine.backoff(0), Duration::from_millis(500));
        assert_eq!(engine.backoff(1), Duration::from_millis(1_000));
        assert_eq!(engine.backoff(2), Duration::from_millis(2_000));
        // Plafond à 8 s
        assert_eq!(engine.backoff(5), Duration::from_secs(8));
        assert_eq!(engine.backoff(16), Duration::from_secs(8));
    }

    #[test]
    fn test_transfer_ids_monotonic_and_non_zero() {
        let mut engine = test_engine();
        engine.next_transfer_id = u32::MAX;
        assert_eq!(engine.alloc_transfer_id(), u32::MAX);
        // Le compteur saute zéro en rebouclant
        assert_eq!(engine.alloc_transfer_id(), 1);
        assert_eq!(engine.alloc_transfer_id(), 2);
    }
}
