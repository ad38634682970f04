//! Static validation of generated Python scripts.
//!
//! The validator parses the untrusted source into an AST (rustpython-parser)
//! and walks it. Nothing is ever executed or imported. Three gates run in
//! order:
//!
//! 1. Syntax gate — parse failure returns a single `SyntaxError` finding
//!    and stops.
//! 2. Import gate — every imported symbol is checked against the
//!    [`ImportPolicy`]; denied and unclassified symbols both fail (fail
//!    closed).
//! 3. Call gate — dynamic evaluation, dynamic import and interactive input
//!    calls are hard failures; bare `open(…)` is surfaced as a warning only.
//!
//! Identical source always yields an identical report; the validator holds
//! no state between calls.

use rustpython_parser::{ast, Parse};
use tracing::{debug, info, warn};

use crate::policy::{ImportPolicy, PolicyDecision};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindingKind {
    SyntaxError,
    ImportViolation,
    CallViolation,
}

/// One validation finding, with the offending symbol and its location.
#[derive(Debug, Clone)]
pub struct Finding {
    pub kind: FindingKind,
    pub symbol: String,
    pub line: usize,
    pub column: usize,
    pub message: String,
}

/// Result of one validation pass. Never persisted beyond the retry loop.
#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<Finding>,
    pub warnings: Vec<Finding>,
    pub suggestions: Vec<String>,
}

impl ValidationReport {
    /// Renders the report as feedback text for the generator retry loop.
    pub fn feedback(&self) -> String {
        let mut out = Vec::new();
        if !self.errors.is_empty() {
            out.push("ERRORS:".to_string());
            for finding in &self.errors {
                out.push(format!(
                    "  - line {}, col {}: {}",
                    finding.line, finding.column, finding.message
                ));
            }
        }
        if !self.warnings.is_empty() {
            out.push("WARNINGS:".to_string());
            for finding in &self.warnings {
                out.push(format!(
                    "  - line {}, col {}: {}",
                    finding.line, finding.column, finding.message
                ));
            }
        }
        if !self.suggestions.is_empty() {
            out.push("SUGGESTIONS:".to_string());
            for suggestion in &self.suggestions {
                out.push(format!("  - {suggestion}"));
            }
        }
        if out.is_empty() {
            "Validation passed".to_string()
        } else {
            out.join("\n")
        }
    }
}

pub struct StaticValidator {
    policy: ImportPolicy,
}

impl StaticValidator {
    pub fn new(policy: ImportPolicy) -> Self {
        Self { policy }
    }

    /// Validates one source text. Purely structural, no execution.
    pub fn validate(&self, source: &str) -> ValidationReport {
        // Syntax gate: on parse failure, report it and run no further checks
        let suite = match ast::Suite::parse(source, "<generated>") {
            Ok(suite) => suite,
            Err(e) => {
                let offset = e.offset.to_usize();
                let (line, column) = line_col(source, offset);
                let finding = Finding {
                    kind: FindingKind::SyntaxError,
                    symbol: String::new(),
                    line,
                    column,
                    message: format!("Syntax error at line {line}: {}", e.error),
                };
                warn!("Validation failed: {}", finding.message);
                return ValidationReport {
                    valid: false,
                    errors: vec![finding],
                    warnings: vec![],
                    suggestions: vec!["Fix the syntax error and try again".to_string()],
                };
            }
        };

        let mut walker = Walker {
            policy: &self.policy,
            source,
            errors: Vec::new(),
            warnings: Vec::new(),
            suggestions: Vec::new(),
        };
        walker.walk_stmts(&suite);

        let valid = walker.errors.is_empty();
        if valid {
            debug!("Validation passed ({} warnings)", walker.warnings.len());
        } else {
            info!(
                "Validation failed: {} error(s), {} warning(s)",
                walker.errors.len(),
                walker.warnings.len()
            );
        }
        ValidationReport {
            valid,
            errors: walker.errors,
            warnings: walker.warnings,
            suggestions: walker.suggestions,
        }
    }
}

/// 1-based line/column for a byte offset.
fn line_col(source: &str, offset: usize) -> (usize, usize) {
    let clamped = offset.min(source.len());
    let before = &source[..clamped];
    let line = before.matches('\n').count() + 1;
    let column = before
        .rfind('\n')
        .map(|nl| clamped - nl)
        .unwrap_or(clamped + 1);
    (line, column)
}

struct Walker<'a> {
    policy: &'a ImportPolicy,
    source: &'a str,
    errors: Vec<Finding>,
    warnings: Vec<Finding>,
    suggestions: Vec<String>,
}

impl Walker<'_> {
    fn location(&self, range: rustpython_parser::text_size::TextRange) -> (usize, usize) {
        line_col(self.source, range.start().to_usize())
    }

    fn import_violation(&mut self, symbol: &str, line: usize, column: usize, denied: bool) {
        let message = if denied {
            format!("Dangerous import detected: '{symbol}'")
        } else {
            format!("Import not on the allowlist: '{symbol}'")
        };
        self.errors.push(Finding {
            kind: FindingKind::ImportViolation,
            symbol: symbol.to_string(),
            line,
            column,
            message,
        });
        self.suggestions.push(format!(
            "Remove the import of '{symbol}'; use requests/boto3 and the allowlisted stdlib modules instead"
        ));
    }

    fn check_import_symbol(&mut self, symbol: &str, line: usize, column: usize) {
        match self.policy.decide(symbol) {
            PolicyDecision::Allow => {}
            PolicyDecision::Deny => self.import_violation(symbol, line, column, true),
            // Fail closed: unclassified imports are rejected
            PolicyDecision::Unknown => self.import_violation(symbol, line, column, false),
        }
    }

    fn check_call(&mut self, func_name: &str, line: usize, column: usize) {
        if func_name.is_empty() {
            return;
        }
        if self.policy.is_denied_call(func_name) {
            self.errors.push(Finding {
                kind: FindingKind::CallViolation,
                symbol: func_name.to_string(),
                line,
                column,
                message: format!("Dangerous function call detected: '{func_name}()'"),
            });
            self.suggestions.push(format!(
                "Remove '{func_name}()'; dynamic evaluation, shell and interactive input are not allowed"
            ));
        } else if self.policy.is_warned_call(func_name) {
            self.warnings.push(Finding {
                kind: FindingKind::CallViolation,
                symbol: func_name.to_string(),
                line,
                column,
                message: format!("File operation detected: '{func_name}()'"),
            });
            self.suggestions
                .push("Ensure file paths are validated and stay inside the working directory".to_string());
        }
    }

    // ── Statement walk ─────────────────────────────────────────────

    fn walk_stmts(&mut self, stmts: &[ast::Stmt]) {
        for stmt in stmts {
            self.walk_stmt(stmt);
        }
    }

    fn walk_stmt(&mut self, stmt: &ast::Stmt) {
        use ast::Stmt;
        match stmt {
            Stmt::Import(import) => {
                let (line, column) = self.location(import.range);
                for alias in &import.names {
                    self.check_import_symbol(alias.name.as_str(), line, column);
                }
            }
            Stmt::ImportFrom(import) => {
                let (line, column) = self.location(import.range);
                let level = import.level.as_ref().map(|l| l.to_u32()).unwrap_or(0);
                if level > 0 {
                    // Relative imports cannot be resolved against the
                    // policy table, so they fail closed.
                    let dots = ".".repeat(level as usize);
                    let module = import.module.as_ref().map(|m| m.as_str()).unwrap_or("");
                    self.import_violation(&format!("{dots}{module}"), line, column, false);
                    return;
                }
                let module = import.module.as_ref().map(|m| m.as_str()).unwrap_or("");
                if !module.is_empty() {
                    self.check_import_symbol(module, line, column);
                }
                for alias in &import.names {
                    let full = if module.is_empty() {
                        alias.name.as_str().to_string()
                    } else {
                        format!("{module}.{}", alias.name.as_str())
                    };
                    self.check_import_symbol(&full, line, column);
                }
            }
            Stmt::FunctionDef(def) => {
                for dec in &def.decorator_list {
                    self.walk_expr(dec);
                }
                self.walk_arguments(&def.args);
                if let Some(returns) = &def.returns {
                    self.walk_expr(returns);
                }
                self.walk_stmts(&def.body);
            }
            Stmt::AsyncFunctionDef(def) => {
                for dec in &def.decorator_list {
                    self.walk_expr(dec);
                }
                self.walk_arguments(&def.args);
                if let Some(returns) = &def.returns {
                    self.walk_expr(returns);
                }
                self.walk_stmts(&def.body);
            }
            Stmt::ClassDef(def) => {
                for base in &def.bases {
                    self.walk_expr(base);
                }
                for keyword in &def.keywords {
                    self.walk_expr(&keyword.value);
                }
                for dec in &def.decorator_list {
                    self.walk_expr(dec);
                }
                self.walk_stmts(&def.body);
            }
            Stmt::Return(ret) => {
                if let Some(value) = &ret.value {
                    self.walk_expr(value);
                }
            }
            Stmt::Delete(del) => {
                for target in &del.targets {
                    self.walk_expr(target);
                }
            }
            Stmt::Assign(assign) => {
                for target in &assign.targets {
                    self.walk_expr(target);
                }
                self.walk_expr(&assign.value);
            }
            Stmt::AugAssign(assign) => {
                self.walk_expr(&assign.target);
                self.walk_expr(&assign.value);
            }
            Stmt::AnnAssign(assign) => {
                self.walk_expr(&assign.target);
                self.walk_expr(&assign.annotation);
                if let Some(value) = &assign.value {
                    self.walk_expr(value);
                }
            }
            Stmt::For(stmt) => {
                self.walk_expr(&stmt.target);
                self.walk_expr(&stmt.iter);
                self.walk_stmts(&stmt.body);
                self.walk_stmts(&stmt.orelse);
            }
            Stmt::AsyncFor(stmt) => {
                self.walk_expr(&stmt.target);
                self.walk_expr(&stmt.iter);
                self.walk_stmts(&stmt.body);
                self.walk_stmts(&stmt.orelse);
            }
            Stmt::While(stmt) => {
                self.walk_expr(&stmt.test);
                self.walk_stmts(&stmt.body);
                self.walk_stmts(&stmt.orelse);
            }
            Stmt::If(stmt) => {
                self.walk_expr(&stmt.test);
                self.walk_stmts(&stmt.body);
                self.walk_stmts(&stmt.orelse);
            }
            Stmt::With(stmt) => {
                for item in &stmt.items {
                    self.walk_expr(&item.context_expr);
                    if let Some(vars) = &item.optional_vars {
                        self.walk_expr(vars);
                    }
                }
                self.walk_stmts(&stmt.body);
            }
            Stmt::AsyncWith(stmt) => {
                for item in &stmt.items {
                    self.walk_expr(&item.context_expr);
                    if let Some(vars) = &item.optional_vars {
                        self.walk_expr(vars);
                    }
                }
                self.walk_stmts(&stmt.body);
            }
            Stmt::Match(stmt) => {
                self.walk_expr(&stmt.subject);
                for case in &stmt.cases {
                    if let Some(guard) = &case.guard {
                        self.walk_expr(guard);
                    }
                    self.walk_stmts(&case.body);
                }
            }
            Stmt::Raise(stmt) => {
                if let Some(exc) = &stmt.exc {
                    self.walk_expr(exc);
                }
                if let Some(cause) = &stmt.cause {
                    self.walk_expr(cause);
                }
            }
            Stmt::Try(stmt) => {
                self.walk_stmts(&stmt.body);
                for handler in &stmt.handlers {
                    let ast::ExceptHandler::ExceptHandler(h) = handler;
                    if let Some(type_) = &h.type_ {
                        self.walk_expr(type_);
                    }
                    self.walk_stmts(&h.body);
                }
                self.walk_stmts(&stmt.orelse);
                self.walk_stmts(&stmt.finalbody);
            }
            Stmt::TryStar(stmt) => {
                self.walk_stmts(&stmt.body);
                for handler in &stmt.handlers {
                    let ast::ExceptHandler::ExceptHandler(h) = handler;
                    if let Some(type_) = &h.type_ {
                        self.walk_expr(type_);
                    }
                    self.walk_stmts(&h.body);
                }
                self.walk_stmts(&stmt.orelse);
                self.walk_stmts(&stmt.finalbody);
            }
            Stmt::Assert(stmt) => {
                self.walk_expr(&stmt.test);
                if let Some(msg) = &stmt.msg {
                    self.walk_expr(msg);
                }
            }
            Stmt::Expr(stmt) => self.walk_expr(&stmt.value),
            // Pass, Break, Continue, Global, Nonlocal, TypeAlias
            _ => {}
        }
    }

    // ── Expression walk ────────────────────────────────────────────

    fn walk_expr(&mut self, expr: &ast::Expr) {
        use ast::Expr;
        match expr {
            Expr::Call(call) => {
                let (line, column) = self.location(call.range);
                let func_name = dotted_name(&call.func);
                self.check_call(&func_name, line, column);
                self.walk_expr(&call.func);
                for arg in &call.args {
                    self.walk_expr(arg);
                }
                for keyword in &call.keywords {
                    self.walk_expr(&keyword.value);
                }
            }
            Expr::BoolOp(op) => {
                for value in &op.values {
                    self.walk_expr(value);
                }
            }
            Expr::NamedExpr(named) => {
                self.walk_expr(&named.target);
                self.walk_expr(&named.value);
            }
            Expr::BinOp(op) => {
                self.walk_expr(&op.left);
                self.walk_expr(&op.right);
            }
            Expr::UnaryOp(op) => self.walk_expr(&op.operand),
            Expr::Lambda(lambda) => {
                self.walk_arguments(&lambda.args);
                self.walk_expr(&lambda.body);
            }
            Expr::IfExp(ifexp) => {
                self.walk_expr(&ifexp.test);
                self.walk_expr(&ifexp.body);
                self.walk_expr(&ifexp.orelse);
            }
            Expr::Dict(dict) => {
                for key in dict.keys.iter().flatten() {
                    self.walk_expr(key);
                }
                for value in &dict.values {
                    self.walk_expr(value);
                }
            }
            Expr::Set(set) => {
                for elt in &set.elts {
                    self.walk_expr(elt);
                }
            }
            Expr::ListComp(comp) => {
                self.walk_expr(&comp.elt);
                self.walk_comprehensions(&comp.generators);
            }
            Expr::SetComp(comp) => {
                self.walk_expr(&comp.elt);
                self.walk_comprehensions(&comp.generators);
            }
            Expr::DictComp(comp) => {
                self.walk_expr(&comp.key);
                self.walk_expr(&comp.value);
                self.walk_comprehensions(&comp.generators);
            }
            Expr::GeneratorExp(comp) => {
                self.walk_expr(&comp.elt);
                self.walk_comprehensions(&comp.generators);
            }
            Expr::Await(inner) => self.walk_expr(&inner.value),
            Expr::Yield(inner) => {
                if let Some(value) = &inner.value {
                    self.walk_expr(value);
                }
            }
            Expr::YieldFrom(inner) => self.walk_expr(&inner.value),
            Expr::Compare(cmp) => {
                self.walk_expr(&cmp.left);
                for comparator in &cmp.comparators {
                    self.walk_expr(comparator);
                }
            }
            Expr::FormattedValue(fv) => self.walk_expr(&fv.value),
            Expr::JoinedStr(js) => {
                for value in &js.values {
                    self.walk_expr(value);
                }
            }
            Expr::Attribute(attr) => self.walk_expr(&attr.value),
            Expr::Subscript(sub) => {
                self.walk_expr(&sub.value);
                self.walk_expr(&sub.slice);
            }
            Expr::Starred(starred) => self.walk_expr(&starred.value),
            Expr::List(list) => {
                for elt in &list.elts {
                    self.walk_expr(elt);
                }
            }
            Expr::Tuple(tuple) => {
                for elt in &tuple.elts {
                    self.walk_expr(elt);
                }
            }
            Expr::Slice(slice) => {
                if let Some(lower) = &slice.lower {
                    self.walk_expr(lower);
                }
                if let Some(upper) = &slice.upper {
                    self.walk_expr(upper);
                }
                if let Some(step) = &slice.step {
                    self.walk_expr(step);
                }
            }
            // Name, Constant
            _ => {}
        }
    }

    /// Parameter defaults and annotations evaluate at `def` time, so they
    /// are as reachable as any statement in the body.
    fn walk_arguments(&mut self, args: &ast::Arguments) {
        for arg in args
            .posonlyargs
            .iter()
            .chain(&args.args)
            .chain(&args.kwonlyargs)
        {
            if let Some(annotation) = &arg.def.annotation {
                self.walk_expr(annotation);
            }
            if let Some(default) = &arg.default {
                self.walk_expr(default);
            }
        }
        if let Some(vararg) = &args.vararg {
            if let Some(annotation) = &vararg.annotation {
                self.walk_expr(annotation);
            }
        }
        if let Some(kwarg) = &args.kwarg {
            if let Some(annotation) = &kwarg.annotation {
                self.walk_expr(annotation);
            }
        }
    }

    fn walk_comprehensions(&mut self, generators: &[ast::Comprehension]) {
        for generator in generators {
            self.walk_expr(&generator.target);
            self.walk_expr(&generator.iter);
            for condition in &generator.ifs {
                self.walk_expr(condition);
            }
        }
    }
}

/// Dotted name of a call target: `Name` → "eval", `Attribute` chain →
/// "os.system". Anything else (a call on a subscript, a lambda, …) has no
/// useful name and returns "".
fn dotted_name(expr: &ast::Expr) -> String {
    match expr {
        ast::Expr::Name(name) => name.id.as_str().to_string(),
        ast::Expr::Attribute(attr) => {
            let base = dotted_name(&attr.value);
            if base.is_empty() {
                attr.attr.as_str().to_string()
            } else {
                format!("{base}.{}", attr.attr.as_str())
            }
        }
        _ => String::new(),
    }
}
