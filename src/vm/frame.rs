//! A single call-frame activation record.

use crate::construct::chunk::Chunk;
use crate::construct::object::ObjRef;

/// One activation of a compiled function. The register window this frame
/// sees is `stack[base .. base + function.register_count]`; `dest` is the
/// caller's register this frame's return value gets copied into (`None`
/// only for the outermost script frame, whose return value is the
/// interpreter's result instead).
pub struct Frame {
    pub function: ObjRef,
    pub base: usize,
    pub ip: usize,
    pub dest: Option<usize>,
}

impl Frame {
    pub fn new(function: ObjRef, base: usize, dest: Option<usize>) -> Frame {
        Frame { function, base, ip: 0, dest }
    }

    pub fn chunk(&self) -> &Chunk {
        &self.function.as_function().expect("frame holds a non-function object").chunk
    }

    pub fn name(&self) -> String {
        match self.function.as_function().and_then(|f| f.name) {
            Some(name) => name.as_str().unwrap_or("?").to_string(),
            None => "<script>".to_string(),
        }
    }

    /// The line of the instruction last read — `ip` has already advanced
    /// past it, hence the `- 1`; used to build the error trace.
    pub fn current_line(&self) -> u32 {
        self.chunk().line_at(self.ip)
    }
}
