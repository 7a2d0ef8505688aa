use crate::message::{AckTarget, ChunkPayload, Message, NakReason, NameTag, MAX_PAYLOAD, NO_CHUNK};
use thiserror::Error;

/// Erreurs de décodage du codec filaire
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Datagramme étranger : taille ou magic ne correspondent pas.
    /// L'appelant l'ignore silencieusement, sans jamais le logger
    /// au-dessus de debug.
    #[error("not an ntpspy datagram")]
    Foreign,

    #[error("unknown message kind: {0}")]
    MalformedKind(u8),

    #[error("datagram length {len} does not match kind {kind}")]
    LengthMismatch { kind: u8, len: usize },

    #[error("field out of range: {0}")]
    FieldOutOfRange(&'static str),
}

/// Taille de l'en-tête NTP obligatoire
pub const HEADER_SIZE: usize = 48;

/// Taille de la zone d'extension déguisée en "key identifier + MAC"
pub const EXT_SIZE: usize = 16;

/// Taille d'un datagramme portant une extension (Start et Data)
pub const EXTENDED_SIZE: usize = HEADER_SIZE + EXT_SIZE;

// Octet 0 : LI=0, VN=4, Mode=3 (client) ou Mode=4 (serveur)
const LI_VN_MODE_CLIENT: u8 = 0x23;
const LI_VN_MODE_SERVER: u8 = 0x24;

// Champs NTP de façade, figés sur des valeurs plausibles
const STRATUM: u8 = 2;
const POLL: u8 = 6;
const PRECISION: u8 = 0xEC; // -20, soit ~1 microseconde
const REFERENCE_ID: u32 = 0x7F00_0001; // a l'allure d'une adresse IPv4

// Offsets des champs détournés
//
//  0..16   façade NTP pure (LI/VN/Mode, stratum, poll, precision,
//          root delay, root dispersion, reference id)
// 16..24   reference timestamp  : [kind:u8][flags:u8][réservé:u16][inutilisé:u32]
// 24..32   originate timestamp  : [TransferId:u32][chunk_index:u32]
// 32..40   receive timestamp    : champ propre au kind
// 40..48   transmit timestamp   : [Magic:u32][body_len:u32]
// 48..64   extension            : charge utile (Data) ou nom (Start)
const OFF_KIND: usize = 16;
const OFF_FLAGS: usize = 17;
const OFF_TRANSFER_ID: usize = 24;
const OFF_CHUNK_INDEX: usize = 28;
const OFF_MAGIC: usize = 40;
const OFF_EXT: usize = 48;

// Valeurs de l'octet kind
const KIND_QUERY: u8 = 1;
const KIND_QUERY_REPLY: u8 = 2;
const KIND_START: u8 = 3;
const KIND_DATA: u8 = 4;
const KIND_END: u8 = 5;
const KIND_ACK: u8 = 6;
const KIND_NAK: u8 = 7;

/// Datagramme encodé, prêt à émettre : 48 octets, ou 64 pour les kinds à
/// extension. Les deux tailles s'observent sur du trafic NTP réel ;
/// n'importe quelle autre taille trahirait le camouflage.
#[derive(Debug, Clone, Copy)]
pub struct Datagram {
    buf: [u8; EXTENDED_SIZE],
    len: usize,
}

impl Datagram {
    pub fn bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

/// Encode un message en datagramme NTP de façade.
/// Tous les champs multi-octets sont en big-endian (network byte order).
pub fn encode(message: &Message, magic: u32) -> Datagram {
    let mut buf = [0u8; EXTENDED_SIZE];

    // Façade : un client NTP émet en mode 3, un serveur répond en mode 4
    buf[0] = match message {
        Message::QueryReply { .. } | Message::Ack { .. } | Message::Nak { .. } => {
            LI_VN_MODE_SERVER
        }
        _ => LI_VN_MODE_CLIENT,
    };
    buf[1] = STRATUM;
    buf[2] = POLL;
    buf[3] = PRECISION;
    // Root delay et root dispersion restent à zéro (octets 4..12)
    buf[12..16].copy_from_slice(&REFERENCE_ID.to_be_bytes());

    buf[OFF_KIND] = kind_byte(message);
    buf[OFF_FLAGS] = match message {
        Message::Ack { target, .. } | Message::Nak { target, .. } => target.flag(),
        _ => 0,
    };

    let (transfer_id, chunk_index) = match message {
        Message::Query | Message::QueryReply { .. } => (0, NO_CHUNK),
        Message::Start { transfer_id, .. } | Message::End { transfer_id, .. } => {
            (*transfer_id, NO_CHUNK)
        }
        Message::Data {
            transfer_id, index, ..
        } => (*transfer_id, *index),
        Message::Ack {
            transfer_id,
            target,
        }
        | Message::Nak {
            transfer_id,
            target,
            ..
        } => (*transfer_id, target.chunk_index()),
    };
    buf[OFF_TRANSFER_ID..OFF_TRANSFER_ID + 4].copy_from_slice(&transfer_id.to_be_bytes());
    buf[OFF_CHUNK_INDEX..OFF_CHUNK_INDEX + 4].copy_from_slice(&chunk_index.to_be_bytes());

    // Champ propre au kind (octets 32..40)
    match message {
        Message::Query => {}
        Message::QueryReply { version, caps } => {
            buf[32..36].copy_from_slice(&version.to_be_bytes());
            buf[36..40].copy_from_slice(&caps.to_be_bytes());
        }
        Message::Start { total_size, .. } => {
            buf[32..40].copy_from_slice(&total_size.to_be_bytes());
        }
        Message::Data { payload, .. } => {
            buf[32..34].copy_from_slice(&(payload.len() as u16).to_be_bytes());
        }
        Message::End {
            total_chunks,
            checksum,
            ..
        } => {
            buf[32..36].copy_from_slice(&total_chunks.to_be_bytes());
            buf[36..40].copy_from_slice(&checksum.to_be_bytes());
        }
        Message::Ack { target, .. } => {
            // raison à zéro : acquittement positif
            buf[32..36].copy_from_slice(&target.chunk_index().to_be_bytes());
        }
        Message::Nak { target, reason, .. } => {
            let index = match target {
                AckTarget::Chunk(index) => *index,
                _ => reason.index(),
            };
            buf[32..36].copy_from_slice(&index.to_be_bytes());
            buf[36..40].copy_from_slice(&reason.code().to_be_bytes());
        }
    }

    // Magic autoritaire dans la moitié haute du transmit timestamp ;
    // body_len reste à zéro, toute charge utile tient dans la forme NTP
    buf[OFF_MAGIC..OFF_MAGIC + 4].copy_from_slice(&magic.to_be_bytes());

    // Zone d'extension (Start et Data uniquement)
    let len = match message {
        Message::Start { filename, .. } => {
            buf[OFF_EXT..OFF_EXT + NameTag::LEN].copy_from_slice(filename.as_bytes());
            EXTENDED_SIZE
        }
        Message::Data { payload, .. } => {
            buf[OFF_EXT..OFF_EXT + payload.len()].copy_from_slice(payload.as_slice());
            EXTENDED_SIZE
        }
        _ => HEADER_SIZE,
    };

    Datagram { buf, len }
}

fn kind_byte(message: &Message) -> u8 {
    match message {
        Message::Query => KIND_QUERY,
        Message::QueryReply { .. } => KIND_QUERY_REPLY,
        Message::Start { .. } => KIND_START,
        Message::Data { .. } => KIND_DATA,
        Message::End { .. } => KIND_END,
        Message::Ack { .. } => KIND_ACK,
        Message::Nak { .. } => KIND_NAK,
    }
}

/// Décode un tampon UDP reçu.
/// Le magic fait foi : tout tampon dont les octets 40..44 ne portent pas le
/// magic attendu est étranger ("not ours"), de même que toute taille autre
/// que 48 ou 64 octets. Le reste de la façade NTP n'est pas contrôlé, un
/// middle-box peut l'avoir réécrit.
pub fn decode(buf: &[u8], magic: u32) -> Result<Message, WireError> {
    if buf.len() != HEADER_SIZE && buf.len() != EXTENDED_SIZE {
        return Err(WireError::Foreign);
    }

    let wire_magic = u32::from_be_bytes([buf[40], buf[41], buf[42], buf[43]]);
    if wire_magic != magic {
        return Err(WireError::Foreign);
    }

    let kind = buf[OFF_KIND];
    if !(KIND_QUERY..=KIND_NAK).contains(&kind) {
        return Err(WireError::MalformedKind(kind));
    }

    // Start et Data portent l'extension de 16 octets, les autres non
    let expects_ext = kind == KIND_START || kind == KIND_DATA;
    if expects_ext != (buf.len() == EXTENDED_SIZE) {
        return Err(WireError::LengthMismatch {
            kind,
            len: buf.len(),
        });
    }

    let flags = buf[OFF_FLAGS];
    let transfer_id = u32::from_be_bytes([buf[24], buf[25], buf[26], buf[27]]);
    let chunk_index = u32::from_be_bytes([buf[28], buf[29], buf[30], buf[31]]);
    let field_hi = u32::from_be_bytes([buf[32], buf[33], buf[34], buf[35]]);
    let field_lo = u32::from_be_bytes([buf[36], buf[37], buf[38], buf[39]]);

    match kind {
        KIND_QUERY => Ok(Message::Query),
        KIND_QUERY_REPLY => Ok(Message::QueryReply {
            version: field_hi,
            caps: field_lo,
        }),
        KIND_START => {
            let total_size = u64::from_be_bytes([
                buf[32], buf[33], buf[34], buf[35], buf[36], buf[37], buf[38], buf[39],
            ]);
            let mut name = [0u8; NameTag::LEN];
            name.copy_from_slice(&buf[OFF_EXT..OFF_EXT + NameTag::LEN]);
            Ok(Message::Start {
                transfer_id,
                total_size,
                filename: NameTag::from_bytes(name),
            })
        }
        KIND_DATA => {
            let payload_len = u16::from_be_bytes([buf[32], buf[33]]) as usize;
            if payload_len == 0 || payload_len > MAX_PAYLOAD {
                return Err(WireError::FieldOutOfRange("data payload length"));
            }
            if chunk_index == NO_CHUNK {
                return Err(WireError::FieldOutOfRange("data chunk index"));
            }
            Ok(Message::Data {
                transfer_id,
                index: chunk_index,
                payload: ChunkPayload::new(&buf[OFF_EXT..OFF_EXT + payload_len]),
            })
        }
        KIND_END => Ok(Message::End {
            transfer_id,
            total_chunks: field_hi,
            checksum: field_lo,
        }),
        KIND_ACK => {
            let target = AckTarget::from_wire(flags, field_hi)
                .ok_or(WireError::FieldOutOfRange("ack target"))?;
            Ok(Message::Ack {
                transfer_id,
                target,
            })
        }
        KIND_NAK => {
            let target = AckTarget::from_wire(flags, field_hi)
                .ok_or(WireError::FieldOutOfRange("nak target"))?;
            let reason = NakReason::from_wire(field_lo, field_hi)
                .ok_or(WireError::FieldOutOfRange("nak reason"))?;
            Ok(Message::Nak {
                transfer_id,
                target,
                reason,
            })
        }
        _ => Err(WireError::MalformedKind(kind)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAGIC: u32 = 0xDEAD_BEEF;

    fn roundtrip(message: Message) {
        let datagram = encode(&message, MAGIC);
        let decoded = decode(datagram.bytes(), MAGIC).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_roundtrip_every_kind() {
        roundtrip(Message::Query);
        roundtrip(Message::QueryReply {
            version: 1,
            caps: 0,
        });
        roundtrip(Message::Start {
            transfer_id: 42,
            total_size: 1_000_000,
            filename: NameTag::from_name("h.txt"),
        });
        roundtrip(Message::Data {
            transfer_id: 42,
            index: 7,
            payload: ChunkPayload::new(b"0123456789abcdef"),
        });
        roundtrip(Message::Data {
            transfer_id: 42,
            index: 8,
            payload: ChunkPayload::new(b"x"),
        });
        roundtrip(Message::End {
            transfer_id: 42,
            total_chunks: 62_500,
            checksum: 0xCAFE_F00D,
        });
        roundtrip(Message::Ack {
            transfer_id: 42,
            target: AckTarget::Chunk(7),
        });
        roundtrip(Message::Ack {
            transfer_id: 42,
            target: AckTarget::Start,
        });
        roundtrip(Message::Ack {
            transfer_id: 42,
            target: AckTarget::End,
        });
        roundtrip(Message::Nak {
            transfer_id: 42,
            target: AckTarget::Chunk(3),
            reason: NakReason::NoSession,
        });
        roundtrip(Message::Nak {
            transfer_id: 42,
            target: AckTarget::End,
            reason: NakReason::MissingChunks(19),
        });
        roundtrip(Message::Nak {
            transfer_id: 42,
            target: AckTarget::Start,
            reason: NakReason::SessionConflict,
        });
    }

    #[test]
    fn test_ntp_facade() {
        let datagram = encode(&Message::Query, MAGIC);
        let bytes = datagram.bytes();
        assert_eq!(bytes.len(), HEADER_SIZE);
        // LI=0, VN=4, Mode=3
        assert_eq!(bytes[0], 0x23);
        assert_eq!(bytes[1], 2); // stratum
        assert_eq!(bytes[2], 6); // poll
        assert_eq!(bytes[3], 0xEC); // precision -20
        assert_eq!(&bytes[4..12], &[0u8; 8]); // root delay + dispersion
        assert_eq!(&bytes[12..16], &[0x7F, 0x00, 0x00, 0x01]);
        // body_len toujours nul
        assert_eq!(&bytes[44..48], &[0u8; 4]);

        // Les réponses serveur passent en mode 4
        let reply = encode(
            &Message::Ack {
                transfer_id: 1,
                target: AckTarget::Start,
            },
            MAGIC,
        );
        assert_eq!(reply.bytes()[0], 0x24);
    }

    #[test]
    fn test_data_and_start_are_64_bytes() {
        let data = encode(
            &Message::Data {
                transfer_id: 1,
                index: 0,
                payload: ChunkPayload::new(b"hello"),
            },
            MAGIC,
        );
        assert_eq!(data.bytes().len(), EXTENDED_SIZE);

        let start = encode(
            &Message::Start {
                transfer_id: 1,
                total_size: 5,
                filename: NameTag::from_name("h.txt"),
            },
            MAGIC,
        );
        assert_eq!(start.bytes().len(), EXTENDED_SIZE);
    }

    #[test]
    fn test_foreign_magic_rejected() {
        let datagram = encode(&Message::Query, MAGIC);
        assert_eq!(
            decode(datagram.bytes(), 0x0BAD_F00D),
            Err(WireError::Foreign)
        );
    }

    #[test]
    fn test_foreign_sizes_rejected() {
        assert_eq!(decode(&[0u8; 47], MAGIC), Err(WireError::Foreign));
        assert_eq!(decode(&[0u8; 49], MAGIC), Err(WireError::Foreign));
        assert_eq!(decode(&[0u8; 1200], MAGIC), Err(WireError::Foreign));
        // Un vrai paquet NTP de 48 octets sans notre magic est étranger
        assert_eq!(decode(&[0u8; 48], MAGIC), Err(WireError::Foreign));
    }

    #[test]
    fn test_unknown_kind() {
        let mut buf = [0u8; HEADER_SIZE];
        buf[40..44].copy_from_slice(&MAGIC.to_be_bytes());
        buf[OFF_KIND] = 9;
        assert_eq!(decode(&buf, MAGIC), Err(WireError::MalformedKind(9)));
    }

    #[test]
    fn test_length_kind_mismatch() {
        // Un End de 64 octets n'existe pas
        let mut buf = [0u8; EXTENDED_SIZE];
        buf[40..44].copy_from_slice(&MAGIC.to_be_bytes());
        buf[OFF_KIND] = 5;
        assert_eq!(
            decode(&buf, MAGIC),
            Err(WireError::LengthMismatch { kind: 5, len: 64 })
        );

        // Un Data de 48 octets non plus
        let mut buf = [0u8; HEADER_SIZE];
        buf[40..44].copy_from_slice(&MAGIC.to_be_bytes());
        buf[OFF_KIND] = 4;
        assert_eq!(
            decode(&buf, MAGIC),
            Err(WireError::LengthMismatch { kind: 4, len: 48 })
        );
    }

    #[test]
    fn test_data_payload_length_bounds() {
        let datagram = encode(
            &Message::Data {
                transfer_id: 1,
                index: 0,
                payload: ChunkPayload::new(b"hello"),
            },
            MAGIC,
        );
        let mut bytes = [0u8; EXTENDED_SIZE];
        bytes.copy_from_slice(datagram.bytes());

        // Longueur nulle : impossible, un fichier vide n'émet aucun Data
        bytes[32..34].copy_from_slice(&0u16.to_be_bytes());
        assert!(matches!(
            decode(&bytes, MAGIC),
            Err(WireError::FieldOutOfRange(_))
        ));

        // Longueur au-delà de l'extension
        bytes[32..34].copy_from_slice(&17u16.to_be_bytes());
        assert!(matches!(
            decode(&bytes, MAGIC),
            Err(WireError::FieldOutOfRange(_))
        ));
    }
}
