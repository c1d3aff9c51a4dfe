//! Pretty printing for the AST and the primitive form
//!
//! The printed primitive form is stable: printing the same body twice gives
//! identical text, so isomorphic bodies compare equal as strings.

use std::fmt;

use crate::flow::{ArgFlowType, FlowDirection, Param};
use crate::prim::{Prim, PrimArg, PrimFork, PrimParam, ProcBody};
use crate::proc::{ProcDef, ProcImpl, ProcSpec};
use crate::stmt::{Call, Exp, Stmt};
use crate::types::{Determinism, ModPath, TypeSpec};

impl fmt::Display for ModPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, seg) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            write!(f, "{}", seg)?;
        }
        Ok(())
    }
}

impl fmt::Display for TypeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeSpec::Named {
                module,
                name,
                params,
            } => {
                if !module.is_empty() {
                    write!(f, "{}.", module)?;
                }
                write!(f, "{}", name)?;
                if !params.is_empty() {
                    write!(f, "(")?;
                    for (i, p) in params.iter().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        write!(f, "{}", p)?;
                    }
                    write!(f, ")")?;
                }
                Ok(())
            }
            TypeSpec::Var(name) => write!(f, "@{}", name),
            TypeSpec::Higher { modifiers, flows } => {
                write!(f, "{{{}}}(", modifiers.detism)?;
                for (i, flow) in flows.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}{}", flow_prefix(flow.dir), flow.ty)?;
                }
                write!(f, ")")
            }
            TypeSpec::Any => write!(f, "_"),
            TypeSpec::Invalid => write!(f, "<invalid>"),
        }
    }
}

impl fmt::Display for Determinism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Determinism::Terminal => "terminal",
            Determinism::Failure => "failure",
            Determinism::Det => "det",
            Determinism::SemiDet => "test",
        };
        write!(f, "{}", text)
    }
}

/// Prefix marking an argument's flow direction
fn flow_prefix(flow: FlowDirection) -> &'static str {
    match flow {
        FlowDirection::In => "",
        FlowDirection::Out => "?",
        FlowDirection::OutByReference => "?&",
        FlowDirection::TakeReference => "&",
        FlowDirection::Unknown => "~",
    }
}

impl fmt::Display for Exp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exp::Var { name, flow } => write!(f, "{}{}", flow_prefix(*flow), name),
            Exp::Int(n) => write!(f, "{}", n),
            Exp::Float(x) => write!(f, "{:?}", x),
            Exp::Str(s) => write!(f, "{:?}", s),
            Exp::Char(c) => write!(f, "{:?}", c),
            Exp::Typed { exp, ty, cast } => {
                let op = if *cast { ":!" } else { ":" };
                write!(f, "{}{}{}", exp, op, ty)
            }
            Exp::AnonProc { params, .. } => write!(f, "<anon/{}>", params.len()),
            Exp::ProcRef { spec, args } => {
                write!(f, "@{}", spec)?;
                if !args.is_empty() {
                    write!(f, "<{} closed>", args.len())?;
                }
                Ok(())
            }
        }
    }
}

impl fmt::Display for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.module.is_empty() {
            write!(f, "{}.", self.module)?;
        }
        write!(f, "{}", self.name)?;
        if let Some(id) = self.proc_id {
            write!(f, "<{}>", id)?;
        }
        write!(f, "(")?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", arg)?;
        }
        write!(f, ")")
    }
}

impl fmt::Display for Stmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stmt::Call(call) => write!(f, "{}", call),
            Stmt::Foreign {
                lang, name, args, ..
            } => {
                write!(f, "foreign {} {}(", lang, name)?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                write!(f, ")")
            }
            Stmt::TestBool(exp) => write!(f, "test {}", exp),
            Stmt::And(stmts) => {
                write!(f, "(")?;
                for (i, s) in stmts.iter().enumerate() {
                    if i > 0 {
                        write!(f, " & ")?;
                    }
                    write!(f, "{}", s)?;
                }
                write!(f, ")")
            }
            Stmt::Or(alts, _) => {
                write!(f, "(")?;
                for (i, s) in alts.iter().enumerate() {
                    if i > 0 {
                        write!(f, " | ")?;
                    }
                    write!(f, "{}", s)?;
                }
                write!(f, ")")
            }
            Stmt::Not(inner) => write!(f, "not {}", inner),
            Stmt::Cond {
                test,
                then_branch,
                else_branch,
                ..
            } => {
                write!(f, "if {} then {{", test)?;
                for s in then_branch {
                    write!(f, " {};", s)?;
                }
                write!(f, " }} else {{")?;
                for s in else_branch {
                    write!(f, " {};", s)?;
                }
                write!(f, " }}")
            }
            Stmt::Loop { body, .. } => {
                write!(f, "do {{")?;
                for s in body {
                    write!(f, " {};", s)?;
                }
                write!(f, " }}")
            }
            Stmt::UseResources { resources, body } => {
                write!(f, "use ")?;
                for (i, r) in resources.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", r.0)?;
                }
                write!(f, " in {{")?;
                for s in body {
                    write!(f, " {};", s)?;
                }
                write!(f, " }}")
            }
            Stmt::Case { exp, cases, .. } => {
                write!(f, "case {} ({} arms)", exp, cases.len())
            }
            Stmt::For { body, .. } => write!(f, "for ({} stmts)", body.len()),
            Stmt::Nop => write!(f, "nop"),
            Stmt::Fail => write!(f, "fail"),
            Stmt::Break => write!(f, "break"),
            Stmt::Next => write!(f, "next"),
        }
    }
}

impl fmt::Display for ProcSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.module.is_empty() {
            write!(f, "{}.", self.module)?;
        }
        write!(f, "{}<{}>", self.name, self.id)
    }
}

impl fmt::Display for PrimArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrimArg::Var(v) => {
                write!(f, "{}{}", flow_prefix(v.flow), v.name)?;
                if v.last_use {
                    write!(f, "^")?;
                }
                if let ArgFlowType::Free = v.kind {
                    write!(f, "~free")?;
                }
                write!(f, ":{}", v.ty)
            }
            PrimArg::Int(n, ty) => write!(f, "{}:{}", n, ty),
            PrimArg::Float(x, ty) => write!(f, "{:?}:{}", x.0, ty),
            PrimArg::Str(s, _) => write!(f, "{:?}", s),
            PrimArg::Char(c) => write!(f, "{:?}", c),
            PrimArg::ProcRef { spec, closed, .. } => {
                write!(f, "@{}", spec)?;
                if !closed.is_empty() {
                    write!(f, "<")?;
                    for (i, arg) in closed.iter().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        write!(f, "{}", arg)?;
                    }
                    write!(f, ">")?;
                }
                Ok(())
            }
            PrimArg::Global { info, ty } => match info {
                crate::prim::GlobalInfo::Resource(r) => write!(f, "<<{}>>:{}", r.0, ty),
                crate::prim::GlobalInfo::Named(n) => write!(f, "<<{}>>:{}", n, ty),
            },
            PrimArg::Unneeded(_) => write!(f, "_"),
            PrimArg::Undef(_) => write!(f, "<undef>"),
        }
    }
}

impl fmt::Display for Prim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Prim::Call { spec, args } => {
                write!(f, "{}(", spec)?;
                write_args(f, args)?;
                write!(f, ")")
            }
            Prim::Higher { target, args } => {
                write!(f, "{}(", target)?;
                write_args(f, args)?;
                write!(f, ")")
            }
            Prim::Foreign {
                lang,
                name,
                flags,
                args,
            } => {
                write!(f, "foreign {} {}", lang.as_str(), name)?;
                for flag in flags {
                    write!(f, " {}", flag)?;
                }
                write!(f, "(")?;
                write_args(f, args)?;
                write!(f, ")")
            }
        }
    }
}

fn write_args(f: &mut fmt::Formatter<'_>, args: &[PrimArg]) -> fmt::Result {
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", arg)?;
    }
    Ok(())
}

impl fmt::Display for ProcBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_body(f, self, 1)
    }
}

fn fmt_body(f: &mut fmt::Formatter<'_>, body: &ProcBody, indent: usize) -> fmt::Result {
    let pad = "  ".repeat(indent);
    for prim in &body.prims {
        writeln!(f, "{}{}", pad, prim.node)?;
    }
    match &body.fork {
        PrimFork::NoFork => Ok(()),
        PrimFork::Fork {
            var,
            ty,
            last_use,
            branches,
        } => {
            let mark = if *last_use { "^" } else { "" };
            writeln!(f, "{}fork {}{}:{}", pad, var, mark, ty)?;
            for (i, branch) in branches.iter().enumerate() {
                writeln!(f, "{}case {}:", pad, i)?;
                fmt_body(f, branch, indent + 1)?;
            }
            Ok(())
        }
    }
}

impl fmt::Display for PrimParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}:{}", flow_prefix(self.flow), self.name, self.ty)
    }
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}:{}", flow_prefix(self.flow), self.name, self.ty)
    }
}

impl fmt::Display for ProcDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.body {
            ProcImpl::Source { body } => {
                write!(f, "{} {}(", self.detism, self.name)?;
                for (i, param) in self.proto.params.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", param)?;
                }
                writeln!(f, "):")?;
                for stmt in body {
                    writeln!(f, "  {}", stmt)?;
                }
                Ok(())
            }
            ProcImpl::Prim { params, body } => {
                write!(f, "proc {}(", self.name)?;
                for (i, param) in params.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", param)?;
                }
                writeln!(f, "):")?;
                fmt_body(f, body, 1)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pos::Placed;

    #[test]
    fn test_type_display() {
        assert_eq!(TypeSpec::int().to_string(), "marl.int");
        assert_eq!(TypeSpec::Any.to_string(), "_");
        assert_eq!(TypeSpec::Var("T".into()).to_string(), "@T");
    }

    #[test]
    fn test_prim_display() {
        let add = Prim::foreign(
            crate::prim::ForeignLang::Llvm,
            "add",
            vec![
                PrimArg::var("a", TypeSpec::int(), FlowDirection::In),
                PrimArg::int(1, TypeSpec::int()),
                PrimArg::var("b", TypeSpec::int(), FlowDirection::Out),
            ],
        );
        assert_eq!(
            add.to_string(),
            "foreign llvm add(a:marl.int, 1:marl.int, ?b:marl.int)"
        );
    }

    #[test]
    fn test_body_print_is_stable() {
        let body = ProcBody::new(
            vec![Placed::unplaced(Prim::mov(
                PrimArg::int(0, TypeSpec::int()),
                PrimArg::var("x", TypeSpec::int(), FlowDirection::Out),
            ))],
            PrimFork::Fork {
                var: "x".into(),
                ty: TypeSpec::int(),
                last_use: true,
                branches: vec![ProcBody::default(), ProcBody::default()],
            },
        );
        assert_eq!(body.to_string(), body.clone().to_string());
        assert!(body.to_string().contains("fork x^:marl.int"));
    }
}
