use std::fmt::{self, Debug, Display};

use faer::prelude::*;

use crate::Module;

/// Multi-line listing of a container's modules.
pub struct DescribeModules<'a> {
    name: &'a str,
    modules: &'a [Box<dyn Module>],
}

impl<'a> DescribeModules<'a> {
    pub fn new(name: &'a str, modules: &'a [Box<dyn Module>]) -> Self {
        Self { name, modules }
    }
}

impl Debug for DescribeModules<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Display::fmt(self, f)
    }
}

fn n_digits(u: usize) -> usize {
    match u {
        0 => 1,
        u => ((u as f32).log10() + 1.0) as usize,
    }
}

impl Display for DescribeModules<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let n = self.modules.len();
        write!(f, "Module {} contains {} modules:", self.name, n)?;
        let width = n_digits(n.saturating_sub(1));
        for (i, module) in self.modules.iter().enumerate() {
            let description = module.describe();
            let mut lines = description.lines();
            write!(f, "\n {i:>width$}: {}", lines.next().unwrap_or_default())?;
            // Nested listings are indented under their index.
            for line in lines {
                write!(f, "\n {:width$}  {line}", "")?;
            }
        }
        Ok(())
    }
}

/// `y = name([W] x + [b])`, one row of the weights per line.
pub struct PrettyPrintLinear<'a> {
    name: &'a str,
    w: MatRef<'a, f32>,
    b: ColRef<'a, f32>,
}

impl<'a> PrettyPrintLinear<'a> {
    pub fn new(name: &'a str, w: MatRef<'a, f32>, b: ColRef<'a, f32>) -> Self {
        Self { name, w, b }
    }
}

impl Debug for PrettyPrintLinear<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Display::fmt(self, f)
    }
}

fn write_element(f: &mut fmt::Formatter, element: f32) -> fmt::Result {
    if element.is_sign_positive() {
        write!(f, " {:.04?}", element)
    } else {
        write!(f, "{:.04?}", element)
    }
}

impl Display for PrettyPrintLinear<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let n = self.w.nrows();
        let center_line = n / 2;
        for i_line in 0..n {
            if i_line == center_line {
                write!(f, "y = {}(", self.name)?;
            } else {
                write!(f, "     ")?;
                for _ in 0..self.name.len() {
                    write!(f, " ")?;
                }
            }
            write!(f, "[")?;
            let mut iter = self.w.row(i_line).iter();
            while let Some(&element) = iter.next() {
                write_element(f, element)?;
                if iter.size_hint().0 != 0 {
                    write!(f, " ")?;
                }
            }
            write!(f, "]")?;
            if i_line == center_line {
                write!(f, " x + ")?;
            } else {
                write!(f, "     ")?;
            }
            write!(f, "[")?;
            write_element(f, *self.b.get(i_line))?;
            write!(f, "]")?;
            if i_line == center_line {
                write!(f, ")")?;
            }
            if i_line + 1 != n {
                writeln!(f)?;
            }
        }
        Ok(())
    }
}
