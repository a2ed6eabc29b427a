use crate::ir::{Annotation, LoopNest, Stmt};
use crate::utils::indent;

use prettytable::{self, format, row, Cell};
use std::fmt;

#[derive(Debug, Copy, Clone, PartialEq, Eq, clap::ValueEnum)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum NestPrintStyle {
    Full,
    Compact,
}

/// Pretty-print a [LoopNest] to stdout.
pub fn pprint(nest: &LoopNest, style: NestPrintStyle) {
    pprint_table(nest, style).printstd()
}

/// Pretty-print a [LoopNest] to a given [fmt::Write].
pub fn pprint_write<W: fmt::Write>(out: &mut W, nest: &LoopNest, style: NestPrintStyle) -> fmt::Result {
    write!(out, "{}", pprint_table(nest, style))
}

pub fn pprint_string(nest: &LoopNest, style: NestPrintStyle) -> String {
    format!("{}", pprint_table(nest, style))
}

fn pprint_table(nest: &LoopNest, style: NestPrintStyle) -> prettytable::Table {
    let mut table = prettytable::Table::new();
    let titles = match style {
        NestPrintStyle::Full => row!["Loop Nest", "Extent", "Annotation", "Scope"],
        NestPrintStyle::Compact => row!["Loop Nest"],
    };
    table.set_titles(titles);

    for (i, stmts) in nest.exprs().iter().enumerate() {
        if nest.expr_count() > 1 {
            table.add_row(row![format!("// expr {i}")]);
        }
        pprint_inner(&mut table, nest, stmts, 0, style);
    }

    let format = format::FormatBuilder::new()
        .separator(
            format::LinePosition::Title,
            format::LineSeparator::new('-', ' ', ' ', ' '),
        )
        .column_separator(' ')
        .build();
    table.set_format(format);
    table
}

fn pprint_inner(
    table: &mut prettytable::Table,
    nest: &LoopNest,
    stmts: &[Stmt],
    depth: usize,
    style: NestPrintStyle,
) {
    let indent_str = indent(depth);
    for stmt in stmts {
        match stmt {
            Stmt::Loop(l) => {
                let name = nest.var_name(l.var());
                let annotation = match l.annotation() {
                    Annotation::Serial => String::new(),
                    a => a.to_string(),
                };
                let r = match style {
                    NestPrintStyle::Full => {
                        let mut r = row![format!("{indent_str}for {name}")];
                        r.add_cell(Cell::new(&l.extent().to_string()));
                        r.add_cell(Cell::new(&annotation));
                        r.add_cell(Cell::new(""));
                        r
                    }
                    NestPrintStyle::Compact if annotation.is_empty() => {
                        row![format!("{indent_str}for {name} in 0..{}", l.extent())]
                    }
                    NestPrintStyle::Compact => {
                        row![format!("{indent_str}for {name} in 0..{} [{annotation}]", l.extent())]
                    }
                };
                table.add_row(r);
                pprint_inner(table, nest, l.body(), depth + 1, style);
            }
            Stmt::Block(b) => {
                let main_str = format!("{indent_str}{}", nest.display_block(b));
                let r = match style {
                    NestPrintStyle::Full => {
                        let scope = nest.buffer(b.write().buffer).scope;
                        let mut r = row![main_str, "", ""];
                        r.add_cell(Cell::new(&scope.to_string()));
                        r
                    }
                    NestPrintStyle::Compact => row![main_str],
                };
                table.add_row(r);
            }
        }
    }
}
