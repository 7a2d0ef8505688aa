use crc::{Crc, CRC_32_ISCSI};

/// Version du protocole covert, renvoyée dans QueryReply
pub const PROTOCOL_VERSION: u32 = 1;

/// Charge utile maximale d'un datagramme Data, en octets.
/// C'est la contrainte dominante du canal : la zone d'extension d'un paquet
/// NTP v4 déguisée en "key id + MAC" ne laisse que 16 octets par datagramme.
pub const MAX_PAYLOAD: usize = 16;

/// Valeur sentinelle du champ chunk_index pour les messages sans chunk
pub const NO_CHUNK: u32 = 0xFFFF_FFFF;

/// CRC32C (polynôme de Castagnoli) : digest d'intégrité du flux transféré.
/// CRC_32_ISCSI est exactement CRC-32C (init 0xFFFFFFFF, réfléchi,
/// xorout 0xFFFFFFFF).
pub static CRC32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Calcule le CRC32C d'un bloc en une passe
pub fn crc32c(data: &[u8]) -> u32 {
    CRC32C.checksum(data)
}

/// Nombre de chunks nécessaires pour une taille déclarée.
/// Retourne None si la taille dépasse ce qu'un index 32 bits peut adresser
/// (la sentinelle NO_CHUNK est exclue de l'espace des index).
pub fn chunk_count(total_size: u64) -> Option<u32> {
    let n = total_size.div_ceil(MAX_PAYLOAD as u64);
    if n >= NO_CHUNK as u64 {
        None
    } else {
        Some(n as u32)
    }
}

/// Raisons de refus transportées par un Nak. Les codes sont stables sur le
/// fil : ne jamais renuméroter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NakReason {
    /// Un Start rejoue un (pair, TransferId) vivant avec des champs différents
    SessionConflict,
    /// Data ou End reçu sans session vivante
    NoSession,
    /// Le CRC32C recalculé ne correspond pas au CRC déclaré
    ChecksumFailed,
    /// End reçu alors que des chunks manquent ; porte le premier index absent
    MissingChunks(u32),
    /// Géométrie de transfert impossible (taille, index ou longueur déclarés)
    FieldOutOfRange,
}

impl NakReason {
    /// Code de raison sur le fil (1..n)
    pub fn code(self) -> u32 {
        match self {
            NakReason::SessionConflict => 1,
            NakReason::NoSession => 2,
            NakReason::ChecksumFailed => 3,
            NakReason::MissingChunks(_) => 4,
            NakReason::FieldOutOfRange => 5,
        }
    }

    /// Reconstruit une raison depuis son code et le champ index du datagramme
    pub fn from_wire(code: u32, index: u32) -> Option<Self> {
        match code {
            1 => Some(NakReason::SessionConflict),
            2 => Some(NakReason::NoSession),
            3 => Some(NakReason::ChecksumFailed),
            4 => Some(NakReason::MissingChunks(index)),
            5 => Some(NakReason::FieldOutOfRange),
            _ => None,
        }
    }

    /// Index associé à la raison, ou NO_CHUNK
    pub fn index(self) -> u32 {
        match self {
            NakReason::MissingChunks(first) => first,
            _ => NO_CHUNK,
        }
    }
}

/// Cible d'un Ack ou d'un Nak : le Start, le End, ou un chunk précis.
/// La cible voyage dans l'octet de flags, ce qui lève l'ambiguïté entre un
/// Ack(Start) retardataire et l'Ack(End) que le client attend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckTarget {
    Chunk(u32),
    Start,
    End,
}

impl AckTarget {
    /// Valeur de l'octet de flags
    pub fn flag(self) -> u8 {
        match self {
            AckTarget::Chunk(_) => 0,
            AckTarget::Start => 1,
            AckTarget::End => 2,
        }
    }

    /// Index de chunk associé, ou NO_CHUNK pour Start/End
    pub fn chunk_index(self) -> u32 {
        match self {
            AckTarget::Chunk(index) => index,
            _ => NO_CHUNK,
        }
    }

    pub fn from_wire(flag: u8, index: u32) -> Option<Self> {
        match flag {
            0 if index != NO_CHUNK => Some(AckTarget::Chunk(index)),
            1 => Some(AckTarget::Start),
            2 => Some(AckTarget::End),
            _ => None,
        }
    }
}

/// Charge utile d'un datagramme Data : de 1 à MAX_PAYLOAD octets.
/// Le constructeur tronque à MAX_PAYLOAD ; la validation de longueur
/// (jamais vide, cohérente avec la taille déclarée) est du ressort du codec
/// et de la session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPayload {
    len: u8,
    bytes: [u8; MAX_PAYLOAD],
}

impl ChunkPayload {
    pub fn new(data: &[u8]) -> Self {
        let len = data.len().min(MAX_PAYLOAD);
        let mut bytes = [0u8; MAX_PAYLOAD];
        bytes[..len].copy_from_slice(&data[..len]);
        ChunkPayload {
            len: len as u8,
            bytes,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Nom de fichier tel que transporté par un Start : 16 octets UTF-8
/// complétés par des NUL. Les noms plus longs sont tronqués de façon
/// déterministe (8 premiers octets + '~' + 7 derniers, aux frontières de
/// caractères) ; en cas de collision dans un même lot, le client bascule
/// sur l'hexadécimal d'un hash stable du nom complet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NameTag([u8; 16]);

impl NameTag {
    pub const LEN: usize = 16;

    /// Construit le tag d'un nom, en le tronquant si nécessaire
    pub fn from_name(name: &str) -> Self {
        if name.len() <= Self::LEN {
            let mut bytes = [0u8; Self::LEN];
            bytes[..name.len()].copy_from_slice(name.as_bytes());
            NameTag(bytes)
        } else {
            let head = prefix_within(name, 8);
            let tail = suffix_within(name, Self::LEN - head.len() - 1);
            let mut bytes = [0u8; Self::LEN];
            bytes[..head.len()].copy_from_slice(head.as_bytes());
            bytes[head.len()] = b'~';
            bytes[head.len() + 1..head.len() + 1 + tail.len()].copy_from_slice(tail.as_bytes());
            NameTag(bytes)
        }
    }

    /// Tag de repli en cas de collision : crc32c(nom) puis longueur en
    /// octets, en hexadécimal (16 caractères exactement)
    pub fn hashed(name: &str) -> Self {
        let mut bytes = [0u8; Self::LEN];
        let hex = format!("{:08x}{:08x}", crc32c(name.as_bytes()), name.len() as u32);
        bytes.copy_from_slice(hex.as_bytes());
        NameTag(bytes)
    }

    pub fn from_bytes(bytes: [u8; Self::LEN]) -> Self {
        NameTag(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; Self::LEN] {
        &self.0
    }

    /// Nom déclaré, jusqu'au premier NUL, en UTF-8 tolérant
    pub fn decoded(&self) -> String {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(Self::LEN);
        String::from_utf8_lossy(&self.0[..end]).into_owned()
    }
}

/// Plus long préfixe d'au plus `max` octets finissant sur une frontière de
/// caractère
fn prefix_within(s: &str, max: usize) -> &str {
    let mut end = max.min(s.len());
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Plus long suffixe d'au plus `max` octets commençant sur une frontière de
/// caractère
fn suffix_within(s: &str, max: usize) -> &str {
    let mut start = s.len().saturating_sub(max);
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

/// Message logique multiplexé sur le codec : l'alphabet du protocole.
/// Variante étiquetée plutôt que hiérarchie de types, chaque kind portant
/// ses champs propres.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message {
    /// Sonde de présence, sans état de session (client vers serveur)
    Query,
    /// Écho de version de protocole et de capacités (serveur vers client)
    QueryReply { version: u32, caps: u32 },
    /// Annonce d'un transfert : identifiant, taille totale, nom
    Start {
        transfer_id: u32,
        total_size: u64,
        filename: NameTag,
    },
    /// Livraison d'un chunk
    Data {
        transfer_id: u32,
        index: u32,
        payload: ChunkPayload,
    },
    /// Assertion de fin : répète le nombre de chunks et le CRC32C
    End {
        transfer_id: u32,
        total_chunks: u32,
        checksum: u32,
    },
    /// Acquittement positif d'un chunk, du Start ou du End
    Ack { transfer_id: u32, target: AckTarget },
    /// Acquittement négatif avec raison
    Nak {
        transfer_id: u32,
        target: AckTarget,
        reason: NakReason,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32c_check_value() {
        // Valeur de contrôle standard du CRC-32/ISCSI
        assert_eq!(crc32c(b"123456789"), 0xE306_9283);
        // Flux vide : init ^ xorout
        assert_eq!(crc32c(b""), 0);
    }

    #[test]
    fn test_chunk_count() {
        assert_eq!(chunk_count(0), Some(0));
        assert_eq!(chunk_count(1), Some(1));
        assert_eq!(chunk_count(16), Some(1));
        assert_eq!(chunk_count(17), Some(2));
        assert_eq!(chunk_count(33), Some(3));
        // 64 GiB moins un : dernier index adressable
        assert_eq!(chunk_count((NO_CHUNK as u64 - 1) * 16), Some(NO_CHUNK - 1));
        assert_eq!(chunk_count(u64::MAX), None);
    }

    #[test]
    fn test_nak_reason_codes_stable() {
        let reasons = [
            (NakReason::SessionConflict, 1),
            (NakReason::NoSession, 2),
            (NakReason::ChecksumFailed, 3),
            (NakReason::MissingChunks(7), 4),
            (NakReason::FieldOutOfRange, 5),
        ];
        for (reason, code) in reasons {
            assert_eq!(reason.code(), code);
            assert_eq!(NakReason::from_wire(code, reason.index()), Some(reason));
        }
        assert_eq!(NakReason::from_wire(0, 0), None);
        assert_eq!(NakReason::from_wire(6, 0), None);
    }

    #[test]
    fn test_name_tag_short_name_untouched() {
        let tag = NameTag::from_name("h.txt");
        assert_eq!(tag.decoded(), "h.txt");

        // Exactement 16 octets : aucun NUL de padding
        let tag = NameTag::from_name("sixteen-bytes.gz");
        assert_eq!(tag.decoded(), "sixteen-bytes.gz");
    }

    #[test]
    fn test_name_tag_truncation() {
        // 17 octets : 8 premiers + '~' + 7 derniers
        let tag = NameTag::from_name("seventeen-chars.x");
        assert_eq!(tag.decoded(), "seventee~chars.x");

        let tag = NameTag::from_name("a-much-longer-filename.tar.gz");
        assert_eq!(tag.decoded(), "a-much-l~.tar.gz");
    }

    #[test]
    fn test_name_tag_multibyte_boundaries() {
        // 'é' fait 2 octets : la troncature ne doit jamais couper un
        // caractère en deux
        let tag = NameTag::from_name("éléphant-mémoire.bin");
        let decoded = tag.decoded();
        assert!(decoded.len() <= NameTag::LEN);
        assert!(!decoded.contains('\u{FFFD}'));
    }

    #[test]
    fn test_name_tag_hashed_is_full_width() {
        let tag = NameTag::hashed("a-much-longer-filename.tar.gz");
        let decoded = tag.decoded();
        assert_eq!(decoded.len(), NameTag::LEN);
        assert!(decoded.bytes().all(|b| b.is_ascii_hexdigit()));
        // Stable pour un même nom
        assert_eq!(tag, NameTag::hashed("a-much-longer-filename.tar.gz"));
    }

    #[test]
    fn test_chunk_payload_clamps() {
        let payload = ChunkPayload::new(&[0xAB; 32]);
        assert_eq!(payload.len(), MAX_PAYLOAD);

        let payload = ChunkPayload::new(b"hello");
        assert_eq!(payload.as_slice(), b"hello");
    }
}
