use std::ops::Range;

/// One named tensor inside a flat parameter buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamEntry {
    pub name: String,
    pub shape: Vec<usize>,
    pub range: Range<usize>,
}

/// Maps a flat parameter buffer into named tensors.
///
/// Entries are contiguous and ordered the way they were pushed, so the buffer can be
/// moved around (optimizers, collectives, checkpoints) as a single slice.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParamLayout {
    entries: Vec<ParamEntry>,
}

impl ParamLayout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a tensor named `name` with the given `shape` at the end of the buffer.
    ///
    /// # Returns
    /// The range the tensor occupies in the flat buffer.
    pub fn push(&mut self, name: impl Into<String>, shape: &[usize]) -> Range<usize> {
        let start = self.size();
        let range = start..start + shape.iter().product::<usize>();

        self.entries.push(ParamEntry {
            name: name.into(),
            shape: shape.to_vec(),
            range: range.clone(),
        });

        range
    }

    /// The total amount of parameters described by this layout.
    pub fn size(&self) -> usize {
        self.entries.last().map(|e| e.range.end).unwrap_or_default()
    }

    pub fn entries(&self) -> &[ParamEntry] {
        &self.entries
    }

    pub fn get(&self, name: &str) -> Option<&ParamEntry> {
        self.entries.iter().find(|e| e.name == name)
    }
}
