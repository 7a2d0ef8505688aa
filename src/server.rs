use crate::config::Config;
use crate::message::{chunk_count, AckTarget, ChunkPayload, Message, NakReason, NameTag, PROTOCOL_VERSION};
use crate::packet::{decode, encode, WireError, EXTENDED_SIZE};
use crate::session::{EndOutcome, Session, SessionError};
use crate::storage::{sanitize_name, FileSink, StorageRoot};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Période de ramasse-miettes des sessions inactives
const GC_INTERVAL: Duration = Duration::from_secs(5);

/// Compteurs du serveur
#[derive(Default)]
pub struct ServerStats {
    pub datagrams_received: u64,
    pub foreign_dropped: u64,
    pub sessions_started: u64,
    pub files_committed: u64,
    pub files_failed: u64,
}

impl ServerStats {
    pub fn log_stats(&self) {
        info!(
            "Stats: received={}, foreign={}, sessions={}, committed={}, failed={}",
            self.datagrams_received,
            self.foreign_dropped,
            self.sessions_started,
            self.files_committed,
            self.files_failed
        );
    }
}

/// Trace d'une session retirée. Les retransmissions tardives de Start, Data
/// ou End reçoivent la même réponse que l'originale au lieu d'un
/// Nak(NoSession) qui ferait échouer un client pourtant arrivé au bout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Retired {
    Committed,
    Failed,
}

/// Moteur serveur : un socket UDP, une boucle de scrutation mono-thread et
/// la table des sessions par (adresse du pair, TransferId). Aucun verrou :
/// le modèle coopératif suffit, la contention est entièrement liée à l'I/O.
pub struct ServerEngine {
    magic: u32,
    bind_address: String,
    port: u16,
    idle_timeout: Duration,
    storage: StorageRoot,
    sessions: HashMap<(SocketAddr, u32), Session<FileSink>>,
    retired: HashMap<(SocketAddr, u32), (Retired, Instant)>,
    stats: ServerStats,
}

impl ServerEngine {
    pub fn new(config: &Config, storage: StorageRoot) -> Self {
        ServerEngine {
            magic: config.net.magic,
            bind_address: config.server.bind_address.clone(),
            port: config.net.port,
            idle_timeout: config.tuning().idle_timeout,
            storage,
            sessions: HashMap::new(),
            retired: HashMap::new(),
            stats: ServerStats::default(),
        }
    }

    /// Démarre le serveur sur l'adresse configurée
    pub fn run(&mut self, shutdown: Arc<AtomicBool>) -> Result<()> {
        let socket = UdpSocket::bind((self.bind_address.as_str(), self.port)).with_context(
            || format!("Failed to bind UDP socket on {}:{}", self.bind_address, self.port),
        )?;
        self.run_on(socket, shutdown)
    }

    /// Boucle principale sur un socket déjà lié
    pub fn run_on(&mut self, socket: UdpSocket, shutdown: Arc<AtomicBool>) -> Result<()> {
        // Timeout de lecture court pour observer le drapeau d'arrêt et
        // cadencer le ramasse-miettes
        socket
            .set_read_timeout(Some(Duration::from_millis(500)))
            .context("Failed to set socket read timeout")?;

        match socket.local_addr() {
            Ok(addr) => info!("ntpspy server listening on {}", addr),
            Err(_) => info!("ntpspy server listening"),
        }
        info!("storage root: {}", self.storage.root().display());

        let mut buf = [0u8; 2 * EXTENDED_SIZE];
        let mut last_gc = Instant::now();

        loop {
            if shutdown.load(Ordering::Relaxed) {
                info!("shutdown signal received, stopping server...");
                break;
            }

            if last_gc.elapsed() >= GC_INTERVAL {
                self.collect_idle();
                last_gc = Instant::now();
            }

            match socket.recv_from(&mut buf) {
                Ok((n, peer)) => {
                    self.stats.datagrams_received += 1;
                    if let Some(reply) = self.handle_datagram(peer, &buf[..n]) {
                        let datagram = encode(&reply, self.magic);
                        if let Err(e) = socket.send_to(datagram.bytes(), peer) {
                            warn!("failed to send reply to {}: {}", peer, e);
                        }
                    }
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) => {}
                Err(e) => error!("receive error: {}", e),
            }
        }

        // Les fichiers temporaires des sessions encore vivantes restent sur
        // le disque : le balayage du prochain démarrage les supprimera
        self.stats.log_stats();
        info!("server stopped");
        Ok(())
    }

    /// Décode un datagramme reçu et retourne l'éventuelle réponse.
    /// Tout ce qui n'est pas un datagramme ntpspy valide est jeté ici même,
    /// sans jamais remonter ni répondre.
    fn handle_datagram(&mut self, peer: SocketAddr, buf: &[u8]) -> Option<Message> {
        match decode(buf, self.magic) {
            Ok(message) => self.dispatch(peer, message),
            Err(WireError::Foreign) => {
                self.stats.foreign_dropped += 1;
                debug!("foreign datagram from {} dropped", peer);
                None
            }
            Err(e) => {
                debug!("malformed datagram from {}: {}", peer, e);
                None
            }
        }
    }

    fn dispatch(&mut self, peer: SocketAddr, message: Message) -> Option<Message> {
        match message {
            // Query est servi sans condition, quel que soit l'état de la
            // table des sessions
            Message::Query => Some(Message::QueryReply {
                version: PROTOCOL_VERSION,
                caps: 0,
            }),
            Message::Start {
                transfer_id,
                total_size,
                filename,
            } => self.handle_start(peer, transfer_id, total_size, filename),
            Message::Data {
                transfer_id,
                index,
                payload,
            } => self.handle_data(peer, transfer_id, index, payload),
            Message::End {
                transfer_id,
                total_chunks,
                checksum,
            } => self.handle_end(peer, transfer_id, total_chunks, checksum),
            // Sens invalide : un serveur ne reçoit jamais ces kinds
            Message::QueryReply { .. } | Message::Ack { .. } | Message::Nak { .. } => {
                debug!("server-to-client message from {} dropped", peer);
                None
            }
        }
    }

    fn handle_start(
        &mut self,
        peer: SocketAddr,
        transfer_id: u32,
        total_size: u64,
        filename: NameTag,
    ) -> Option<Message> {
        let key = (peer, transfer_id);

        if let Some(session) = self.sessions.get_mut(&key) {
            return if session.matches_start(total_size, &filename) {
                // Start retransmis : ré-acquitter sans toucher à l'état
                session.touch();
                Some(Message::Ack {
                    transfer_id,
                    target: AckTarget::Start,
                })
            } else {
                warn!(
                    "conflicting Start for live transfer {:#010x} from {}",
                    transfer_id, peer
                );
                Some(Message::Nak {
                    transfer_id,
                    target: AckTarget::Start,
                    reason: NakReason::SessionConflict,
                })
            };
        }

        if let Some((Retired::Committed, _)) = self.retired.get(&key) {
            // Rejouée après commit : le client n'a pas vu notre Ack(End)
            return Some(Message::Ack {
                transfer_id,
                target: AckTarget::Start,
            });
        }

        let Some(total_chunks) = chunk_count(total_size) else {
            return Some(Message::Nak {
                transfer_id,
                target: AckTarget::Start,
                reason: NakReason::FieldOutOfRange,
            });
        };

        let final_name = sanitize_name(&filename.decoded());
        let sink = match self.storage.begin(transfer_id) {
            Ok(sink) => sink,
            Err(e) => {
                // Erreur locale : pas de session, pas d'acquittement, le
                // client finira par expirer
                error!("cannot create temp file for {:#010x}: {}", transfer_id, e);
                return None;
            }
        };

        info!(
            "transfer {:#010x} from {}: \"{}\" ({} bytes, {} chunks)",
            transfer_id, peer, final_name, total_size, total_chunks
        );
        self.sessions.insert(
            key,
            Session::new(transfer_id, filename, final_name, total_size, total_chunks, sink),
        );
        self.stats.sessions_started += 1;

        Some(Message::Ack {
            transfer_id,
            target: AckTarget::Start,
        })
    }

    fn handle_data(
        &mut self,
        peer: SocketAddr,
        transfer_id: u32,
        index: u32,
        payload: ChunkPayload,
    ) -> Option<Message> {
        let key = (peer, transfer_id);

        let Some(session) = self.sessions.get_mut(&key) else {
            return match self.retired.get(&key) {
                // Retardataire d'un transfert déjà publié
                Some((Retired::Committed, _)) => Some(Message::Ack {
                    transfer_id,
                    target: AckTarget::Chunk(index),
                }),
                // Jamais de création de session sur un Data : le client
                // doit repartir d'un Start
                _ => Some(Message::Nak {
                    transfer_id,
                    target: AckTarget::Chunk(index),
                    reason: NakReason::NoSession,
                }),
            };
        };

        session.touch();
        match session.accept_chunk(index, &payload) {
            // Les duplicatas sont ré-acquittés sans réécriture
            Ok(_) => Some(Message::Ack {
                transfer_id,
                target: AckTarget::Chunk(index),
            }),
            Err(SessionError::OutOfRange(what)) => {
                debug!("chunk {} of {:#010x} rejected: {}", index, transfer_id, what);
                Some(Message::Nak {
                    transfer_id,
                    target: AckTarget::Chunk(index),
                    reason: NakReason::FieldOutOfRange,
                })
            }
            Err(SessionError::Io(e)) => {
                // Erreur locale fatale pour la session : données détruites,
                // plus aucun acquittement
                error!("I/O error on transfer {:#010x}: {}", transfer_id, e);
                self.retire(key, Retired::Failed);
                None
            }
        }
    }

    fn handle_end(
        &mut self,
        peer: SocketAddr,
        transfer_id: u32,
        total_chunks: u32,
        checksum: u32,
    ) -> Option<Message> {
        let key = (peer, transfer_id);

        let Some(session) = self.sessions.get_mut(&key) else {
            return match self.retired.get(&key) {
                Some((Retired::Committed, _)) => Some(Message::Ack {
                    transfer_id,
                    target: AckTarget::End,
                }),
                Some((Retired::Failed, _)) => Some(Message::Nak {
                    transfer_id,
                    target: AckTarget::End,
                    reason: NakReason::ChecksumFailed,
                }),
                None => Some(Message::Nak {
                    transfer_id,
                    target: AckTarget::End,
                    reason: NakReason::NoSession,
                }),
            };
        };

        session.touch();
        match session.finish(total_chunks, checksum) {
            Ok(EndOutcome::Missing(first)) => {
                debug!(
                    "transfer {:#010x} incomplete at End, first missing chunk {}",
                    transfer_id, first
                );
                Some(Message::Nak {
                    transfer_id,
                    target: AckTarget::End,
                    reason: NakReason::MissingChunks(first),
                })
            }
            Ok(EndOutcome::Committed(path)) => {
                info!("transfer {:#010x} committed to {}", transfer_id, path.display());
                self.sessions.remove(&key);
                self.retired.insert(key, (Retired::Committed, Instant::now()));
                self.stats.files_committed += 1;
                Some(Message::Ack {
                    transfer_id,
                    target: AckTarget::End,
                })
            }
            Ok(EndOutcome::ChecksumMismatch) => {
                warn!(
                    "transfer {:#010x} failed checksum verification, dropping",
                    transfer_id
                );
                self.sessions.remove(&key);
                self.retired.insert(key, (Retired::Failed, Instant::now()));
                self.stats.files_failed += 1;
                Some(Message::Nak {
                    transfer_id,
                    target: AckTarget::End,
                    reason: NakReason::ChecksumFailed,
                })
            }
            Err(SessionError::OutOfRange(what)) => {
                debug!("End for {:#010x} rejected: {}", transfer_id, what);
                Some(Message::Nak {
                    transfer_id,
                    target: AckTarget::End,
                    reason: NakReason::FieldOutOfRange,
                })
            }
            Err(SessionError::Io(e)) => {
                error!("I/O error committing {:#010x}: {}", transfer_id, e);
                self.retire(key, Retired::Failed);
                None
            }
        }
    }

    /// Retire une session en détruisant ses données partielles
    fn retire(&mut self, key: (SocketAddr, u32), state: Retired) {
        if let Some(session) = self.sessions.remove(&key) {
            session.abort();
        }
        self.retired.insert(key, (state, Instant::now()));
    }

    /// Abandonne les sessions sans activité depuis le timeout d'inactivité.
    /// Aucun Nak n'est envoyé : le client concerné a expiré de son côté
    /// depuis longtemps.
    fn collect_idle(&mut self) {
        let idle_timeout = self.idle_timeout;
        let expired: Vec<(SocketAddr, u32)> = self
            .sessions
            .iter()
            .filter(|(_, session)| session.idle_for() >= idle_timeout)
            .map(|(key, _)| *key)
            .collect();

        for key in expired {
            if let Some(session) = self.sessions.remove(&key) {
                warn!(
                    "transfer {:#010x} from {} idle for {:?}, dropping ({}/{} chunks received)",
                    session.transfer_id(),
                    key.0,
                    idle_timeout,
                    session.received(),
                    session.total_chunks()
                );
                session.abort();
            }
        }

        self.retired
            .retain(|_, (_, retired_at)| retired_at.elapsed() < idle_timeout);
    }

    #[allow(dead_code)]
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }
}
