use crate::ts::errors::TreeSitterError;
use ast_grep_language::{LanguageExt, SupportLang};
use tree_sitter::{Parser, Tree};

/// Tree-sitter parser bound to one language.
pub struct SourceParser {
    parser: Parser,
    language: SupportLang,
}

impl SourceParser {
    /// Create a parser for `language`.
    pub fn new(language: SupportLang) -> Result<Self, TreeSitterError> {
        let mut parser = Parser::new();
        let ts_lang = language.get_ts_language();
        parser
            .set_language(&ts_lang)
            .map_err(|_| TreeSitterError::LanguageSet {
                language: format!("{language:?}"),
            })?;

        Ok(Self { parser, language })
    }

    /// The language this parser was built for.
    pub fn language(&self) -> SupportLang {
        self.language
    }

    /// Parse source code into a tree-sitter Tree.
    pub fn parse(&mut self, source: &str) -> Result<Tree, TreeSitterError> {
        self.parser
            .parse(source, None)
            .ok_or(TreeSitterError::ParseFailed)
    }

    /// Parse source code and return the tree along with the source.
    pub fn parse_with_source<'a>(
        &mut self,
        source: &'a str,
    ) -> Result<ParsedSource<'a>, TreeSitterError> {
        let tree = self.parse(source)?;
        Ok(ParsedSource { source, tree })
    }
}

/// A parsed source file with its tree-sitter tree.
pub struct ParsedSource<'a> {
    pub source: &'a str,
    pub tree: Tree,
}

impl<'a> ParsedSource<'a> {
    /// Get the root node of the tree.
    pub fn root_node(&self) -> tree_sitter::Node<'_> {
        self.tree.root_node()
    }

    /// Check if the tree contains any ERROR or MISSING nodes.
    pub fn has_errors(&self) -> bool {
        self.tree.root_node().has_error()
    }

    /// Get all ERROR and MISSING nodes in document order.
    pub fn error_nodes(&self) -> Vec<ErrorNode> {
        let mut errors = Vec::new();
        collect_error_nodes(self.tree.root_node(), self.source, &mut errors);
        errors
    }
}

/// Information about an ERROR or MISSING node in the parse tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorNode {
    pub byte_start: usize,
    pub byte_end: usize,
    /// 1-based line.
    pub line: usize,
    /// 1-based column.
    pub column: usize,
    pub missing: bool,
    /// Offending source text with newlines escaped, at most a short line.
    pub context: String,
}

fn collect_error_nodes(node: tree_sitter::Node<'_>, source: &str, errors: &mut Vec<ErrorNode>) {
    if !node.has_error() {
        return;
    }

    if node.is_error() || node.is_missing() {
        let start = node.start_position();
        let context_end = node.end_byte().min(node.start_byte() + 60).min(source.len());
        let context = source
            .get(node.start_byte()..context_end)
            .unwrap_or("")
            .replace('\n', "\\n");

        errors.push(ErrorNode {
            byte_start: node.start_byte(),
            byte_end: node.end_byte(),
            line: start.row + 1,
            column: start.column + 1,
            missing: node.is_missing(),
            context,
        });
    }

    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        collect_error_nodes(child, source, errors);
    }
}
