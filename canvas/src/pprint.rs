use crate::graph::{KernelGraph, PrimitiveNode, TensorId};
use crate::primitive::PrimitiveT;
use crate::utils::{ascii_name, join_into_string};

use prettytable::{self, format, row};
use std::fmt;

#[derive(Debug, Copy, Clone, PartialEq)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum GraphPrintStyle {
    Full,
    Compact,
}

/// Pretty-print a [KernelGraph] to stdout.
pub fn pprint(graph: &KernelGraph, style: GraphPrintStyle) {
    pprint_table(graph, style).printstd()
}

pub fn pprint_string(graph: &KernelGraph, style: GraphPrintStyle) -> String {
    format!("{}", pprint_table(graph, style))
}

fn tensor_name(t: TensorId) -> String {
    ascii_name(t.0)
}

/// Renders one primitive as `outs = Name(ins)`.
fn node_line(node: &PrimitiveNode) -> String {
    let call = format!(
        "{}({})",
        node.op.name(),
        join_into_string(node.ins.iter().map(|&t| tensor_name(t)), ", ")
    );
    if node.outs.is_empty() {
        call
    } else {
        let outs = join_into_string(node.outs.iter().map(|&t| tensor_name(t)), ", ");
        format!("{outs} = {call}")
    }
}

fn pprint_table(graph: &KernelGraph, style: GraphPrintStyle) -> prettytable::Table {
    let mut table = prettytable::Table::new();
    table.set_titles(match style {
        GraphPrintStyle::Full => row!["Primitive", "Output Shapes", "Consumers"],
        GraphPrintStyle::Compact => row!["Primitive"],
    });

    for node in graph.primitives() {
        let line = node_line(node);
        let r = match style {
            GraphPrintStyle::Full => {
                let shapes = join_into_string(
                    node.outs.iter().map(|&t| graph.tensor(t).shape),
                    "\n",
                );
                let consumers = node
                    .outs
                    .iter()
                    .map(|&t| graph.tensor(t).consumers.len())
                    .sum::<usize>();
                row![line, shapes, consumers]
            }
            GraphPrintStyle::Compact => row![line],
        };
        table.add_row(r);
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

impl fmt::Display for KernelGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lines = self.primitives().iter().map(node_line);
        write!(f, "{}", join_into_string(lines, "; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::StaticVar;
    use crate::primitive::{ElementWise, ElementWiseType, Group, FC};
    use proptest::prelude::*;

    fn residual() -> KernelGraph {
        let mut g = KernelGraph::new();
        let fc = g
            .apply_primitive(FC::new(StaticVar::C.into()).into(), &[g.input()])
            .unwrap();
        let t = g.primitive(fc).outs[0];
        g.apply_primitive(ElementWise(ElementWiseType::Add).into(), &[g.input(), t])
            .unwrap();
        g.apply_output().unwrap();
        g
    }

    #[test]
    fn test_display_lists_primitives_in_order() {
        assert_eq!(
            residual().to_string(),
            "a = Input(); b = FC_C(a); c = Add(a, b); Output(c)"
        );
    }

    #[test]
    fn test_full_style_has_shapes() {
        let s = pprint_string(&residual(), GraphPrintStyle::Full);
        assert!(s.contains("Output Shapes"));
        assert!(s.contains("b = FC_C(a)"));
        assert!(s.contains("[1, C, 1, 1, H, W]"));
    }

    #[test]
    fn test_compact_style_omits_shapes() {
        let mut g = KernelGraph::new();
        g.apply_primitive(Group::new(StaticVar::G.into()).into(), &[g.input()])
            .unwrap();
        let s = pprint_string(&g, GraphPrintStyle::Compact);
        assert!(s.contains("b = Group_G(a)"));
        assert!(!s.contains("[1, C"));
    }

    proptest! {
        #[test]
        fn test_pprint_never_panics(style in any::<GraphPrintStyle>()) {
            let s = pprint_string(&residual(), style);
            prop_assert!(s.lines().count() >= 4);
        }
    }
}
