use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Préfixe et suffixe des fichiers temporaires de réassemblage
const PART_PREFIX: &str = ".ntpspy-";
const PART_SUFFIX: &str = ".part";

/// Réceptacle abstrait d'un transfert en cours : écritures positionnées,
/// relecture pour le digest incrémental, publication atomique ou abandon.
/// Le moteur serveur ne voit que cette interface ; la session n'a jamais
/// connaissance du système de fichiers.
pub trait Sink {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()>;

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Publie le contenu sous son nom final et retourne le chemin retenu.
    /// Rien n'est visible sous un nom définitif avant cet appel.
    fn commit(&mut self, final_name: &str) -> io::Result<PathBuf>;

    /// Abandonne le transfert et détruit les données partielles
    fn abort(&mut self);
}

/// Sink fichier : un `.ntpspy-<id>-<rand>.part` sous la racine de stockage,
/// renommé atomiquement au commit
pub struct FileSink {
    file: File,
    temp_path: PathBuf,
    root: PathBuf,
    overwrite: bool,
}

impl Sink for FileSink {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)
    }

    fn commit(&mut self, final_name: &str) -> io::Result<PathBuf> {
        self.file.sync_all()?;
        let target = unique_target(&self.root, final_name, self.overwrite);
        fs::rename(&self.temp_path, &target)?;
        Ok(target)
    }

    fn abort(&mut self) {
        if let Err(e) = fs::remove_file(&self.temp_path) {
            warn!("failed to remove {}: {}", self.temp_path.display(), e);
        }
    }
}

/// Racine de stockage côté serveur : balayage au démarrage, création des
/// fichiers temporaires et politique de nommage final
pub struct StorageRoot {
    root: PathBuf,
    overwrite: bool,
}

impl StorageRoot {
    /// Ouvre (et crée au besoin) la racine, puis balaie les fichiers
    /// temporaires d'une exécution précédente. Deux serveurs pointés sur la
    /// même racine se balaieraient mutuellement : ne pas le faire.
    pub fn open(root: &Path, overwrite: bool) -> io::Result<Self> {
        fs::create_dir_all(root)?;
        let storage = StorageRoot {
            root: root.to_path_buf(),
            overwrite,
        };
        storage.sweep()?;
        Ok(storage)
    }

    /// Supprime les `.ntpspy-*.part` laissés par un arrêt brutal
    fn sweep(&self) -> io::Result<()> {
        let mut swept = 0u32;
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(PART_PREFIX) && name.ends_with(PART_SUFFIX) {
                if let Err(e) = fs::remove_file(entry.path()) {
                    warn!("sweep: failed to remove {}: {}", name, e);
                } else {
                    swept += 1;
                }
            }
        }
        if swept > 0 {
            warn!("swept {} stale partial file(s) from previous run", swept);
        }
        Ok(())
    }

    /// Crée le fichier temporaire d'un nouveau transfert
    pub fn begin(&self, transfer_id: u32) -> io::Result<FileSink> {
        // create_new évite d'écraser un transfert concurrent dont le
        // suffixe aléatoire serait identique
        for _ in 0..4 {
            let temp_path = self.root.join(format!(
                "{}{}-{:08x}{}",
                PART_PREFIX,
                transfer_id,
                rand::random::<u32>(),
                PART_SUFFIX
            ));
            match OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(&temp_path)
            {
                Ok(file) => {
                    debug!("reassembling into {}", temp_path.display());
                    return Ok(FileSink {
                        file,
                        temp_path,
                        root: self.root.clone(),
                        overwrite: self.overwrite,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e),
            }
        }
        Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "could not find a free temp file name",
        ))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Nettoie un nom déclaré par le pair : octets de chemin retirés, noms
/// vides ou réservés remplacés. Le pair n'est pas digne de confiance, le
/// nom ne doit jamais sortir de la racine de stockage.
pub fn sanitize_name(declared: &str) -> String {
    let base = declared
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or("")
        .trim_matches(char::from(0));
    if base.is_empty() || base == "." || base == ".." {
        "unnamed".to_string()
    } else {
        base.to_string()
    }
}

/// Choisit le chemin final d'un fichier entrant : le nom demandé, ou en cas
/// de collision sans écrasement, le premier `nom-N` libre avant l'extension
fn unique_target(root: &Path, name: &str, overwrite: bool) -> PathBuf {
    let candidate = root.join(name);
    if overwrite || !candidate.exists() {
        return candidate;
    }

    let (stem, ext) = match name.rsplit_once('.') {
        // Les noms cachés comme ".bashrc" gardent leur point initial
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (name, None),
    };

    let mut n = 1u64;
    loop {
        let alt = match ext {
            Some(ext) => format!("{stem}-{n}.{ext}"),
            None => format!("{stem}-{n}"),
        };
        let path = root.join(&alt);
        if !path.exists() {
            return path;
        }
        n += 1;
    }
}

/// Sink en mémoire pour les tests de réassemblage
#[cfg(test)]
pub struct MemorySink {
    pub data: Vec<u8>,
    pub writes: u32,
    pub committed: Option<String>,
    pub aborted: bool,
}

#[cfg(test)]
impl MemorySink {
    pub fn new() -> Self {
        MemorySink {
            data: Vec::new(),
            writes: 0,
            committed: None,
            aborted: false,
        }
    }
}

#[cfg(test)]
impl Sink for MemorySink {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        let end = offset as usize + data.len();
        if self.data.len() < end {
            self.data.resize(end, 0);
        }
        self.data[offset as usize..end].copy_from_slice(data);
        self.writes += 1;
        Ok(())
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let end = offset as usize + buf.len();
        if self.data.len() < end {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "short read"));
        }
        buf.copy_from_slice(&self.data[offset as usize..end]);
        Ok(())
    }

    fn commit(&mut self, final_name: &str) -> io::Result<PathBuf> {
        self.committed = Some(final_name.to_string());
        Ok(PathBuf::from(final_name))
    }

    fn abort(&mut self) {
        self.aborted = true;
    }
}
