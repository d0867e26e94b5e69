/// Line-oriented source builder with brace-aware indentation.
#[derive(Default)]
pub(crate) struct SourceWriter {
    source: String,
    indent: usize,
}

impl SourceWriter {
    pub(crate) fn line(&mut self, line: impl AsRef<str>) {
        let line = line.as_ref();
        if !line.is_empty() {
            for _ in 0..self.indent {
                self.source.push_str("    ");
            }
            self.source.push_str(line);
        }
        self.source.push('\n');
    }

    pub(crate) fn blank(&mut self) {
        self.source.push('\n');
    }

    /// Appends a multi-line snippet verbatim.
    pub(crate) fn raw(&mut self, text: &str) {
        self.source.push_str(text);
        if !text.ends_with('\n') {
            self.source.push('\n');
        }
    }

    /// Starts a braced block; an empty header opens a bare block.
    pub(crate) fn open(&mut self, header: impl AsRef<str>) {
        let header = header.as_ref();
        if !header.is_empty() {
            self.line(header);
        }
        self.line("{");
        self.indent += 1;
    }

    pub(crate) fn close(&mut self) {
        self.indent = self.indent.saturating_sub(1);
        self.line("}");
    }

    pub(crate) fn indented(&mut self, f: impl FnOnce(&mut Self)) {
        self.indent += 1;
        f(self);
        self.indent = self.indent.saturating_sub(1);
    }

    pub(crate) fn finish(self) -> String {
        self.source
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_indent_their_bodies() {
        let mut w = SourceWriter::default();
        w.open("if (tid == 0)");
        w.line("x = 1;");
        w.close();
        assert_eq!(w.finish(), "if (tid == 0)\n{\n    x = 1;\n}\n");
    }
}
