//! Reading and writing the file interfaces: model parameters, gene
//! labels, the gene→species map, Phylip distance matrices, Newick trees,
//! and the per-run debug log.
//!
//! Paths ending in `.gz` are read and written through gzip transparently
//! (distance matrices tend to arrive compressed, and the debug log can get
//! large on long MCMC runs).

use crate::error::{Result, SindirError};
use crate::likelihood::Params;
use crate::recon::SpeciesMap;
use crate::search::{Visited, num_possible_trees};
use crate::tree::Tree;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::cmp::Ordering;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

fn is_gz(path: &Path) -> bool {
    path.to_string_lossy().ends_with(".gz")
}

fn open_reader(path: &Path) -> Result<Box<dyn BufRead>> {
    let file = File::open(path)?;
    if is_gz(path) {
        Ok(Box::new(BufReader::new(GzDecoder::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

fn read_to_string(path: &Path) -> Result<String> {
    let mut text = String::new();
    open_reader(path)?.read_to_string(&mut text)?;
    Ok(text)
}

/// Reads a model parameter file: one TSV record per line, `key` then two
/// values. The `baserate` key carries the gamma `(α, β)`; every other key
/// names a species-tree node and carries that branch's `(μ, σ)`.
/// Numeric-leading keys (internal species nodes) are normalized through
/// integer parsing.
pub fn read_params(path: impl AsRef<Path>) -> Result<Params> {
    let mut params = Params::new(1.0, 1.0);
    for line in open_reader(path.as_ref())?.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.trim_end_matches('\n').split('\t').collect();
        if fields.len() != 3 {
            return Err(SindirError::ParamFile(format!(
                "expected 'key\\tv1\\tv2', got '{line}'"
            )));
        }
        let parse = |v: &str| {
            v.trim()
                .parse::<f64>()
                .map_err(|_| SindirError::ParamFile(format!("bad value '{v}'")))
        };
        let (v1, v2) = (parse(fields[1])?, parse(fields[2])?);

        let key = fields[0].trim();
        if key == "baserate" {
            params.baserate = (v1, v2);
        } else if key.starts_with(|c: char| c.is_ascii_digit()) {
            let normalized = key
                .parse::<i64>()
                .map_err(|_| SindirError::ParamFile(format!("bad node key '{key}'")))?;
            params.set_branch(normalized.to_string(), v1, v2);
        } else {
            params.set_branch(key, v1, v2);
        }
    }
    Ok(params)
}

/// Numeric keys sort numerically and come first; everything else sorts
/// lexicographically after them.
fn key_order(a: &str, b: &str) -> Ordering {
    match (a.parse::<i64>(), b.parse::<i64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

/// Writes a parameter file that [`read_params`] will read back, keys
/// sorted.
pub fn write_params(path: impl AsRef<Path>, params: &Params) -> Result<()> {
    let mut out = BufWriter::new(File::create(path.as_ref())?);
    let mut keys: Vec<&str> = params.branches().map(|(name, _)| name).collect();
    keys.sort_by(|a, b| key_order(a, b));
    for key in keys {
        let (mu, sigma) = params.branch(key)?;
        writeln!(out, "{key}\t{mu}\t{sigma}")?;
    }
    let (alpha, beta) = params.baserate;
    writeln!(out, "baserate\t{alpha}\t{beta}")?;
    out.flush()?;
    Ok(())
}

/// Reads gene labels: FASTA record ids for `.fasta`/`.fa`/`.align`
/// files, one label per line otherwise.
pub fn read_labels(path: impl AsRef<Path>) -> Result<Vec<String>> {
    let path = path.as_ref();
    let name = path.to_string_lossy();
    let fasta = [".fasta", ".fa", ".align"]
        .iter()
        .any(|ext| name.ends_with(ext));

    let text = read_to_string(path)?;
    let labels = if fasta {
        text.lines()
            .filter_map(|line| line.strip_prefix('>'))
            .filter_map(|header| header.split_whitespace().next())
            .map(str::to_string)
            .collect()
    } else {
        text.lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect()
    };
    Ok(labels)
}

/// Reads a gene→species map: `pattern<TAB>species` per line, `*` suffix
/// for prefix patterns, `#` for comments.
pub fn read_species_map(path: impl AsRef<Path>) -> Result<SpeciesMap> {
    let mut map = SpeciesMap::new();
    for line in open_reader(path.as_ref())?.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_whitespace();
        match (fields.next(), fields.next()) {
            (Some(pattern), Some(species)) => map.add(pattern, species),
            _ => {
                return Err(SindirError::SpeciesMapFile(format!(
                    "expected 'pattern<TAB>species', got '{line}'"
                )));
            }
        }
    }
    Ok(map)
}

/// Reads a square Phylip distance matrix: a leading count line, then one
/// row per label (`label` followed by `n` values; rows may wrap).
pub fn read_dist_matrix(path: impl AsRef<Path>) -> Result<(Vec<String>, Vec<Vec<f64>>)> {
    let text = read_to_string(path.as_ref())?;
    let mut tokens = text.split_whitespace();

    let n: usize = tokens
        .next()
        .ok_or_else(|| SindirError::DistMatrix("empty file".into()))?
        .parse()
        .map_err(|_| SindirError::DistMatrix("bad taxon count".into()))?;

    let mut labels = Vec::with_capacity(n);
    let mut matrix = Vec::with_capacity(n);
    for row in 0..n {
        let label = tokens
            .next()
            .ok_or_else(|| SindirError::DistMatrix(format!("missing row {row}")))?;
        labels.push(label.to_string());
        let mut values = Vec::with_capacity(n);
        for col in 0..n {
            let value: f64 = tokens
                .next()
                .ok_or_else(|| {
                    SindirError::DistMatrix(format!("row '{label}' is short at column {col}"))
                })?
                .parse()
                .map_err(|_| {
                    SindirError::DistMatrix(format!("bad value in row '{label}' column {col}"))
                })?;
            values.push(value);
        }
        matrix.push(values);
    }
    if tokens.next().is_some() {
        return Err(SindirError::DistMatrix("trailing data after matrix".into()));
    }
    Ok((labels, matrix))
}

/// Reads one Newick tree from a file.
pub fn read_tree_file(path: impl AsRef<Path>) -> Result<Tree> {
    Tree::from_newick(&read_to_string(path.as_ref())?)
}

/// Writes a tree as a single Newick line.
pub fn write_tree_file(path: impl AsRef<Path>, tree: &Tree) -> Result<()> {
    fs::write(path.as_ref(), format!("{}\n", tree.to_newick()))?;
    Ok(())
}

/// Sink for the `<out>.debug` trace: search progress lines and the
/// per-phase table of the best visited topologies.
///
/// A disabled log swallows everything; a write failure disables the log
/// with a warning rather than aborting the search.
pub struct DebugLog {
    out: Option<Box<dyn Write + Send>>,
}

impl DebugLog {
    pub fn disabled() -> Self {
        DebugLog { out: None }
    }

    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::create(path)?;
        let out: Box<dyn Write + Send> = if is_gz(path) {
            Box::new(BufWriter::new(GzEncoder::new(file, Compression::default())))
        } else {
            Box::new(BufWriter::new(file))
        };
        Ok(DebugLog { out: Some(out) })
    }

    pub fn line(&mut self, text: &str) {
        if let Some(out) = self.out.as_mut() {
            if writeln!(out, "{text}").is_err() {
                tracing::warn!("debug log write failed; disabling");
                self.out = None;
            }
        }
    }

    /// Per-node dump of a scored tree: one line per node in preorder with
    /// the edge length, the node's path contribution, and the
    /// extra/unfold flags, followed by the per-tree totals.
    pub fn tree_report(&mut self, tree: &Tree) {
        if self.out.is_none() {
            return;
        }
        let mut depths = std::collections::HashMap::new();
        for id in tree.preorder() {
            let node = tree.node(id);
            let depth = node
                .parent
                .map_or(0usize, |parent| depths[&parent] + 1);
            depths.insert(id, depth);

            let mut notes = String::new();
            if node.diag.extra {
                notes.push('E');
            }
            if node.diag.unfold {
                notes.push('U');
            }
            let logl = node
                .diag
                .logl
                .map_or_else(|| "*".to_string(), |l| format!("{l:.3}"));
            self.line(&format!(
                "{}[{}] {:.3} ({logl}) {notes}",
                "  ".repeat(depth),
                node.name,
                node.dist
            ));
        }
        if let Some(logl) = tree.data.logl {
            self.line(&format!("logl:      {logl:.6}"));
            self.line(&format!("eventlogl: {:.6}", tree.data.eventlogl));
            self.line(&format!("errorlogl: {:.6}", tree.data.errorlogl));
        }
        self.line(&format!("baserate:  {:.6}", tree.data.baserate));
        self.line(&format!("treelen:   {:.6}", tree.total_length()));
        self.line(&format!("error:     {:.6}", tree.data.error));
    }

    /// The best topologies seen so far, most likely first.
    pub fn visited_summary(&mut self, visited: &Visited) {
        if self.out.is_none() || visited.is_empty() {
            return;
        }
        let nleaves = visited
            .entries()
            .next()
            .map_or(0, |entry| entry.tree.leaf_names().len());
        self.line(&format!(
            "\nmost likely trees out of {} visited ({:.1} possible):",
            visited.len(),
            num_possible_trees(nleaves)
        ));
        self.line("LOGL\tERROR\tBASERATE\tCOUNT\tTOPOLOGY");

        let mut rows: Vec<_> = visited.entries().collect();
        rows.sort_by(|a, b| {
            b.logl
                .partial_cmp(&a.logl)
                .unwrap_or(Ordering::Equal)
        });
        for entry in rows.into_iter().take(80) {
            self.line(&format!(
                "{:.6}\t{:.6}\t{:.6}\t{}\t{}",
                entry.logl,
                entry.tree.data.error,
                entry.tree.data.baserate,
                entry.count,
                entry.tree.to_newick()
            ));
        }
    }

    pub fn flush(&mut self) {
        if let Some(out) = self.out.as_mut() {
            let _ = out.flush();
        }
    }
}

impl Drop for DebugLog {
    fn drop(&mut self) {
        self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn params_round_trip_with_numeric_keys() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("model.params");

        let mut params = Params::new(2.0, 0.5);
        params.set_branch("A", 4.0, 2.0);
        params.set_branch("B", 3.0, 1.0);
        params.set_branch("1", 0.0, 1.0);
        params.set_branch("12", 0.7, 0.2);
        write_params(&path, &params).unwrap();

        let back = read_params(&path).unwrap();
        assert_eq!(back.baserate, (2.0, 0.5));
        assert_eq!(back.branch("A").unwrap(), (4.0, 2.0));
        assert_eq!(back.branch("B").unwrap(), (3.0, 1.0));
        assert_eq!(back.branch("1").unwrap(), (0.0, 1.0));
        assert_eq!(back.branch("12").unwrap(), (0.7, 0.2));

        // numeric keys come first, in numeric order
        let text = fs::read_to_string(&path).unwrap();
        let keys: Vec<&str> = text
            .lines()
            .map(|line| line.split('\t').next().unwrap())
            .collect();
        assert_eq!(keys, vec!["1", "12", "A", "B", "baserate"]);
    }

    #[test]
    fn leading_zero_node_keys_normalize() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("model.params");
        fs::write(&path, "007\t1.5\t0.5\n").unwrap();

        let params = read_params(&path).unwrap();
        assert_eq!(params.branch("7").unwrap(), (1.5, 0.5));
    }

    #[test]
    fn labels_from_plain_text_and_fasta() {
        let dir = tempdir().unwrap();

        let plain = dir.path().join("genes.txt");
        fs::write(&plain, "a1\na2\n\nb\n").unwrap();
        assert_eq!(read_labels(&plain).unwrap(), vec!["a1", "a2", "b"]);

        let fasta = dir.path().join("genes.fasta");
        fs::write(&fasta, ">a1 some description\nACGT\n>a2\nACGT\n>b\nAC\n").unwrap();
        assert_eq!(read_labels(&fasta).unwrap(), vec!["a1", "a2", "b"]);
    }

    #[test]
    fn species_map_file_supports_patterns_and_comments() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("genes.smap");
        fs::write(&path, "# first letter decides\na*\tA\nb9\tB\n").unwrap();

        let map = read_species_map(&path).unwrap();
        assert_eq!(map.species_of("a12").unwrap(), "A");
        assert_eq!(map.species_of("b9").unwrap(), "B");
        assert!(map.species_of("b1").is_err());
    }

    #[test]
    fn phylip_matrix_reads_with_wrapped_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dists.phylip");
        fs::write(
            &path,
            "3\na1 0.0 1.0\n 2.0\na2 1.0 0.0 1.5\nb 2.0 1.5 0.0\n",
        )
        .unwrap();

        let (labels, matrix) = read_dist_matrix(&path).unwrap();
        assert_eq!(labels, vec!["a1", "a2", "b"]);
        assert_eq!(matrix[0], vec![0.0, 1.0, 2.0]);
        assert_eq!(matrix[2], vec![2.0, 1.5, 0.0]);
    }

    #[test]
    fn phylip_matrix_rejects_short_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dists.phylip");
        fs::write(&path, "2\na 0.0 1.0\nb 1.0\n").unwrap();
        assert!(read_dist_matrix(&path).is_err());
    }

    #[test]
    fn gzipped_matrix_reads_transparently() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dists.phylip.gz");
        let file = File::create(&path).unwrap();
        let mut enc = GzEncoder::new(file, Compression::default());
        enc.write_all(b"2\na 0.0 3.0\nb 3.0 0.0\n").unwrap();
        enc.finish().unwrap();

        let (labels, matrix) = read_dist_matrix(&path).unwrap();
        assert_eq!(labels, vec!["a", "b"]);
        assert_eq!(matrix[0][1], 3.0);
    }

    #[test]
    fn tree_file_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.tree");
        let tree = Tree::from_newick("((a:1,b:2):0.5,c:3);").unwrap();

        write_tree_file(&path, &tree).unwrap();
        let back = read_tree_file(&path).unwrap();
        let mut names = back.leaf_names();
        names.sort();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn debug_log_writes_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.debug");
        {
            let mut log = DebugLog::create(&path).unwrap();
            log.line("adding b");
            log.line("chain 0 step 3: best logl -12.5");
        }
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("adding b"));
        assert!(text.contains("best logl"));

        // disabled logs swallow quietly
        DebugLog::disabled().line("nothing");
    }
}
