//! Sink appending crawled entity documents to a JSON lines file.

use crate::models::EntityDocument;
use log::{debug, error, info};
use semcrawl_pipe::{Flow, Interrupt, ItemType, Params, PipeError, ProcessingContext, Processor, Stage};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

pub const DEF_OUTPUT_FILE: &str = "entities.jsonl";

const NAME: &str = "DocumentWriter";

/// Settings of a [`DocumentWriter`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriterParams {
    /// Output file, relative paths resolved against the working directory
    pub out: PathBuf,
}

impl Default for WriterParams {
    fn default() -> Self {
        Self {
            out: PathBuf::from(DEF_OUTPUT_FILE),
        }
    }
}

impl WriterParams {
    pub fn from_params(params: &Params) -> semcrawl_pipe::Result<Self> {
        Ok(Self {
            out: params.optional("out", PathBuf::from(DEF_OUTPUT_FILE))?,
        })
    }
}

pub struct DocumentWriter {
    params: WriterParams,
    path: Option<PathBuf>,
    out: Option<BufWriter<File>>,
    written: usize,
}

impl DocumentWriter {
    pub fn new(params: WriterParams) -> Self {
        Self {
            params,
            path: None,
            out: None,
            written: 0,
        }
    }

    /// Documents written so far
    pub fn written(&self) -> usize {
        self.written
    }

    fn write(&mut self, doc: &EntityDocument) -> std::io::Result<()> {
        if let Some(out) = self.out.as_mut() {
            serde_json::to_writer(&mut *out, doc)?;
            out.write_all(b"\n")?;
            self.written += 1;
        }
        Ok(())
    }
}

impl Processor for DocumentWriter {
    fn name(&self) -> &str {
        NAME
    }

    fn input(&self) -> ItemType {
        ItemType::of::<EntityDocument>()
    }

    fn set_context(&mut self, ctx: &ProcessingContext) -> semcrawl_pipe::Result<()> {
        let path = ctx.resolve(&self.params.out);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| PipeError::init(NAME, format!("can't open {}: {}", path.display(), e)))?;
        self.out = Some(BufWriter::new(file));
        self.path = Some(path);
        Ok(())
    }

    fn can_start(&self) -> std::result::Result<(), String> {
        match self.out {
            Some(_) => Ok(()),
            None => Err("no output file".to_string()),
        }
    }

    fn process(&mut self, stage: &Stage) -> std::result::Result<Flow, Interrupt> {
        let doc = stage.read_as::<EntityDocument>()?;
        if let Err(e) = self.write(&doc) {
            error!("Can't write document {}: {}", doc.url, e);
        }
        debug!("Wrote {}", doc.url);
        Ok(Flow::Continue)
    }

    fn post_run(&mut self, _stage: &Stage) {
        if let Some(out) = self.out.as_mut() {
            if let Err(e) = out.flush() {
                error!("Can't flush documents: {}", e);
            }
        }
        if let Some(path) = &self.path {
            info!("{} documents written to {}", self.written, path.display());
        }
    }
}
