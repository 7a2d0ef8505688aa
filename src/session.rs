use crate::message::{ChunkPayload, NameTag, CRC32C, MAX_PAYLOAD};
use crate::storage::Sink;
use crc::Digest;
use std::io;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Erreurs de session côté serveur
#[derive(Error, Debug)]
pub enum SessionError {
    /// Champ déclaré incompatible avec la géométrie annoncée au Start ;
    /// devient un Nak(FieldOutOfRange) sur le fil
    #[error("field out of range: {0}")]
    OutOfRange(&'static str),

    /// Erreur d'entrée/sortie locale : fatale pour la session
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Issue d'un chunk accepté
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    Stored,
    /// Déjà reçu : ré-acquitté sans réécriture
    Duplicate,
}

/// Issue d'un End
#[derive(Debug, PartialEq, Eq)]
pub enum EndOutcome {
    /// Fichier publié sous son nom final
    Committed(PathBuf),
    /// Des chunks manquent encore ; porte le premier index absent
    Missing(u32),
    /// CRC32C recalculé différent du CRC déclaré ; données détruites,
    /// la session est à retirer
    ChecksumMismatch,
}

/// Bitmap des chunks reçus. Ne croît que de façon monotone : un bit posé ne
/// s'efface jamais.
pub struct Bitmap {
    words: Vec<u64>,
    len: u32,
    set_count: u32,
}

impl Bitmap {
    pub fn new(len: u32) -> Self {
        Bitmap {
            words: vec![0u64; (len as usize).div_ceil(64)],
            len,
            set_count: 0,
        }
    }

    /// Pose le bit `index` ; retourne false s'il l'était déjà
    pub fn set(&mut self, index: u32) -> bool {
        let word = &mut self.words[index as usize / 64];
        let mask = 1u64 << (index % 64);
        if *word & mask != 0 {
            return false;
        }
        *word |= mask;
        self.set_count += 1;
        true
    }

    pub fn get(&self, index: u32) -> bool {
        if index >= self.len {
            return false;
        }
        self.words[index as usize / 64] & (1u64 << (index % 64)) != 0
    }

    pub fn count(&self) -> u32 {
        self.set_count
    }

    pub fn is_full(&self) -> bool {
        self.set_count == self.len
    }

    /// Premier index non posé, ou None si tout est reçu
    pub fn first_unset(&self) -> Option<u32> {
        for (w, &word) in self.words.iter().enumerate() {
            if word != u64::MAX {
                let index = w as u32 * 64 + word.trailing_ones();
                if index < self.len {
                    return Some(index);
                }
            }
        }
        None
    }
}

/// État de réassemblage d'un transfert côté serveur : bitmap des chunks
/// reçus, digest incrémental, sink d'écriture et horloge d'inactivité
pub struct Session<S: Sink> {
    transfer_id: u32,
    declared_name: NameTag,
    final_name: String,
    total_size: u64,
    total_chunks: u32,
    bitmap: Bitmap,
    sink: S,
    digest: Digest<'static, u32>,
    /// Prochain index attendu par le digest : tout chunk d'index inférieur
    /// a déjà été incorporé
    digest_next: u32,
    last_activity: Instant,
}

impl<S: Sink> Session<S> {
    pub fn new(
        transfer_id: u32,
        declared_name: NameTag,
        final_name: String,
        total_size: u64,
        total_chunks: u32,
        sink: S,
    ) -> Self {
        Session {
            transfer_id,
            declared_name,
            final_name,
            total_size,
            total_chunks,
            bitmap: Bitmap::new(total_chunks),
            sink,
            digest: CRC32C.digest(),
            digest_next: 0,
            last_activity: Instant::now(),
        }
    }

    /// Vrai si un Start rejoué redéclare exactement la même chose
    pub fn matches_start(&self, total_size: u64, declared_name: &NameTag) -> bool {
        self.total_size == total_size && self.declared_name == *declared_name
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    pub fn transfer_id(&self) -> u32 {
        self.transfer_id
    }

    #[allow(dead_code)]
    pub fn final_name(&self) -> &str {
        &self.final_name
    }

    pub fn received(&self) -> u32 {
        self.bitmap.count()
    }

    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    /// Longueur attendue du chunk `index` : MAX_PAYLOAD, sauf pour le
    /// dernier chunk d'un fichier dont la taille n'est pas un multiple
    fn expected_len(&self, index: u32) -> usize {
        let offset = index as u64 * MAX_PAYLOAD as u64;
        (self.total_size - offset).min(MAX_PAYLOAD as u64) as usize
    }

    /// Accepte un chunk : écrit à `index * 16` au premier passage, ignore
    /// les duplicatas, et fait progresser le digest sur la plage contiguë
    /// désormais disponible
    pub fn accept_chunk(
        &mut self,
        index: u32,
        payload: &ChunkPayload,
    ) -> Result<ChunkOutcome, SessionError> {
        if index >= self.total_chunks {
            return Err(SessionError::OutOfRange("chunk index beyond declared size"));
        }
        if payload.len() != self.expected_len(index) {
            return Err(SessionError::OutOfRange("chunk length"));
        }
        if self.bitmap.get(index) {
            return Ok(ChunkOutcome::Duplicate);
        }

        self.sink
            .write_at(index as u64 * MAX_PAYLOAD as u64, payload.as_slice())?;
        self.bitmap.set(index);

        if index == self.digest_next {
            self.digest.update(payload.as_slice());
            self.digest_next += 1;
            self.drain_digest()?;
        }

        Ok(ChunkOutcome::Stored)
    }

    /// Incorpore au digest les chunks arrivés dans le désordre, relus
    /// depuis le sink, tant que la plage reste contiguë. Le End n'a ainsi
    /// jamais besoin d'une seconde passe complète.
    fn drain_digest(&mut self) -> io::Result<()> {
        let mut buf = [0u8; MAX_PAYLOAD];
        while self.digest_next < self.total_chunks && self.bitmap.get(self.digest_next) {
            let len = self.expected_len(self.digest_next);
            self.sink
                .read_at(self.digest_next as u64 * MAX_PAYLOAD as u64, &mut buf[..len])?;
            self.digest.update(&buf[..len]);
            self.digest_next += 1;
        }
        Ok(())
    }

    /// Procédure de commit du End. Le fichier n'est renommé que si le
    /// bitmap est complet ET que le digest recalculé égale le CRC déclaré.
    pub fn finish(&mut self, total_chunks: u32, checksum: u32) -> Result<EndOutcome, SessionError> {
        if total_chunks != self.total_chunks {
            return Err(SessionError::OutOfRange("declared chunk count"));
        }
        if let Some(missing) = self.bitmap.first_unset() {
            return Ok(EndOutcome::Missing(missing));
        }

        let digest = std::mem::replace(&mut self.digest, CRC32C.digest());
        let computed = digest.finalize();
        if computed != checksum {
            self.sink.abort();
            return Ok(EndOutcome::ChecksumMismatch);
        }

        let path = self.sink.commit(&self.final_name)?;
        Ok(EndOutcome::Committed(path))
    }

    /// Abandon (timeout d'inactivité, erreur locale) : détruit les données
    /// partielles
    pub fn abort(mut self) {
        self.sink.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{chunk_count, crc32c};
    use crate::storage::MemorySink;

    fn payload_at(data: &[u8], index: u32) -> ChunkPayload {
        let start = index as usize * MAX_PAYLOAD;
        let end = (start + MAX_PAYLOAD).min(data.len());
        ChunkPayload::new(&data[start..end])
    }

    fn session_for(data: &[u8]) -> Session<MemorySink> {
        let total_chunks = chunk_count(data.len() as u64).unwrap();
        Session::new(
            7,
            NameTag::from_name("t.bin"),
            "t.bin".to_string(),
            data.len() as u64,
            total_chunks,
            MemorySink::new(),
        )
    }

    #[test]
    fn test_bitmap() {
        let mut bitmap = Bitmap::new(130);
        assert_eq!(bitmap.first_unset(), Some(0));
        assert!(bitmap.set(0));
        assert!(!bitmap.set(0));
        assert!(bitmap.set(129));
        assert_eq!(bitmap.count(), 2);
        assert_eq!(bitmap.first_unset(), Some(1));
        for i in 1..129 {
            bitmap.set(i);
        }
        assert!(bitmap.is_full());
        assert_eq!(bitmap.first_unset(), None);
    }

    #[test]
    fn test_in_order_reassembly() {
        let data = b"The quick brown fox jumps over the lazy dog".to_vec();
        let mut session = session_for(&data);
        let total = session.total_chunks();

        for i in 0..total {
            let outcome = session.accept_chunk(i, &payload_at(&data, i)).unwrap();
            assert_eq!(outcome, ChunkOutcome::Stored);
        }

        match session.finish(total, crc32c(&data)).unwrap() {
            EndOutcome::Committed(_) => {}
            other => panic!("expected commit, got {:?}", other),
        }
        assert_eq!(session.sink.data, data);
        assert_eq!(session.sink.committed.as_deref(), Some("t.bin"));
    }

    #[test]
    fn test_out_of_order_reassembly() {
        let data: Vec<u8> = (0u8..=255).cycle().take(16 * 5 + 3).collect();
        let mut session = session_for(&data);
        let total = session.total_chunks();
        assert_eq!(total, 6);

        // Ordre arbitraire, y compris le dernier chunk court en premier
        for &i in &[5u32, 0, 3, 1, 4, 2] {
            session.accept_chunk(i, &payload_at(&data, i)).unwrap();
        }

        match session.finish(total, crc32c(&data)).unwrap() {
            EndOutcome::Committed(_) => {}
            other => panic!("expected commit, got {:?}", other),
        }
        assert_eq!(session.sink.data, data);
    }

    #[test]
    fn test_duplicates_written_once() {
        let data = b"duplicated chunk payload".to_vec();
        let mut session = session_for(&data);

        assert_eq!(
            session.accept_chunk(0, &payload_at(&data, 0)).unwrap(),
            ChunkOutcome::Stored
        );
        let writes_after_first = session.sink.writes;
        for _ in 0..5 {
            assert_eq!(
                session.accept_chunk(0, &payload_at(&data, 0)).unwrap(),
                ChunkOutcome::Duplicate
            );
        }
        assert_eq!(session.sink.writes, writes_after_first);
    }

    #[test]
    fn test_missing_chunk_hint() {
        let data: Vec<u8> = vec![0x5A; 33];
        let mut session = session_for(&data);

        session.accept_chunk(0, &payload_at(&data, 0)).unwrap();
        session.accept_chunk(2, &payload_at(&data, 2)).unwrap();

        assert_eq!(
            session.finish(3, crc32c(&data)).unwrap(),
            EndOutcome::Missing(1)
        );

        // La session survit au Nak : le chunk manquant peut encore arriver
        session.accept_chunk(1, &payload_at(&data, 1)).unwrap();
        match session.finish(3, crc32c(&data)).unwrap() {
            EndOutcome::Committed(_) => {}
            other => panic!("expected commit, got {:?}", other),
        }
    }

    #[test]
    fn test_checksum_mismatch_aborts() {
        let data = b"some payload".to_vec();
        let mut session = session_for(&data);
        session.accept_chunk(0, &payload_at(&data, 0)).unwrap();

        assert_eq!(
            session.finish(1, 0xBAD0_BAD0).unwrap(),
            EndOutcome::ChecksumMismatch
        );
        assert!(session.sink.aborted);
        assert!(session.sink.committed.is_none());
    }

    #[test]
    fn test_empty_transfer() {
        let mut session = session_for(b"");
        assert_eq!(session.total_chunks(), 0);
        // CRC32C du flux vide = 0
        match session.finish(0, 0).unwrap() {
            EndOutcome::Committed(_) => {}
            other => panic!("expected commit, got {:?}", other),
        }
        assert!(session.sink.data.is_empty());
    }

    #[test]
    fn test_geometry_rejected() {
        let data = vec![1u8; 40];
        let mut session = session_for(&data);

        // Index au-delà de la taille déclarée
        assert!(matches!(
            session.accept_chunk(3, &ChunkPayload::new(&[0u8; 16])),
            Err(SessionError::OutOfRange(_))
        ));

        // Mauvaise longueur pour le dernier chunk (8 octets attendus)
        assert!(matches!(
            session.accept_chunk(2, &ChunkPayload::new(&[0u8; 16])),
            Err(SessionError::OutOfRange(_))
        ));

        // End redéclarant un autre nombre de chunks
        assert!(matches!(
            session.finish(4, 0),
            Err(SessionError::OutOfRange(_))
        ));
    }
}
