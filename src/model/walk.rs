//! Iteration helpers over a scope.
//!
//! The top-level functions walk sequentially. [`parallel`] has the same
//! shapes on the rayon pool; its mutating walkers collect every failure and
//! return them together once all workers are done.

use crate::dex::error::DexError;
use crate::ir::instruction::IRInstruction;
use crate::model::class::{DexClass, DexField, DexMethod};

pub fn classes<'a, F>(scope: &[&'a DexClass], mut f: F)
where
    F: FnMut(&'a DexClass),
{
    for &cls in scope {
        f(cls);
    }
}

pub fn methods<'a, F>(scope: &[&'a DexClass], mut f: F)
where
    F: FnMut(&'a DexMethod),
{
    for &cls in scope {
        for m in cls.get_all_methods() {
            f(m);
        }
    }
}

pub fn fields<'a, F>(scope: &[&'a DexClass], mut f: F)
where
    F: FnMut(&'a DexField),
{
    for &cls in scope {
        for field in cls.get_all_fields() {
            f(field);
        }
    }
}

/// Visits every instruction of every ballooned method.
pub fn opcodes<'a, F>(scope: &[&'a DexClass], mut f: F)
where
    F: FnMut(&'a DexMethod, &'a IRInstruction),
{
    methods(scope, |m| {
        if let Some(code) = m.get_code() {
            for (_, insn) in code.list().instructions() {
                f(m, insn);
            }
        }
    });
}

pub fn methods_mut<F>(classes: &mut [DexClass], mut f: F) -> Result<(), DexError>
where
    F: FnMut(&mut DexMethod) -> Result<(), DexError>,
{
    for cls in classes.iter_mut() {
        for m in cls.get_all_methods_mut() {
            f(m)?;
        }
    }
    Ok(())
}

pub mod parallel {
    use std::sync::Mutex;

    use rayon::prelude::*;

    use super::*;

    pub fn classes<F>(scope: &[&DexClass], f: F)
    where
        F: Fn(&DexClass) + Sync + Send,
    {
        scope.par_iter().for_each(|c| f(c));
    }

    pub fn methods<F>(scope: &[&DexClass], f: F)
    where
        F: Fn(&DexMethod) + Sync + Send,
    {
        scope.par_iter().for_each(|c| c.get_all_methods().for_each(&f));
    }

    pub fn opcodes<F>(scope: &[&DexClass], f: F)
    where
        F: Fn(&DexMethod, &IRInstruction) + Sync + Send,
    {
        methods(scope, |m| {
            if let Some(code) = m.get_code() {
                for (_, insn) in code.list().instructions() {
                    f(m, insn);
                }
            }
        });
    }

    /// Maps every method and folds the results; `reduce` must be associative.
    pub fn reduce_methods<T, M, R>(scope: &[&DexClass], map: M, reduce: R) -> T
    where
        T: Default + Send,
        M: Fn(&DexMethod) -> T + Sync + Send,
        R: Fn(T, T) -> T + Sync + Send,
    {
        scope
            .par_iter()
            .flat_map_iter(|&c| c.get_all_methods())
            .map(&map)
            .reduce(T::default, &reduce)
    }

    /// Runs `f` on every method, one class per task. Failures are gathered
    /// and reported as a single aggregate error.
    pub fn methods_mut<F>(classes: &mut [DexClass], f: F) -> Result<(), DexError>
    where
        F: Fn(&mut DexMethod) -> Result<(), DexError> + Sync + Send,
    {
        let errors = Mutex::new(Vec::new());
        classes.par_iter_mut().for_each(|cls| {
            for m in cls.get_all_methods_mut() {
                if let Err(e) = f(m) {
                    if let Ok(mut errors) = errors.lock() {
                        errors.push(e);
                    }
                }
            }
        });
        DexError::aggregate(errors.into_inner().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dex::code::DexCode;
    use crate::dex::error::ErrorKind;
    use crate::dex::instruction::DexInstruction;
    use crate::dex::opcodes::DexOpcode;
    use crate::model::access::DexAccessFlags;
    use crate::model::pool::{DexMethodRef, DexType};

    fn build(name: &str, methods: &[&str]) -> DexClass {
        let mut cls = DexClass::new(DexType::make(name), "walk-test").unwrap();
        for m in methods {
            let mut def = DexMethod::new(DexMethodRef::make_from_descriptor(&format!("{}.{}", name, m)).unwrap());
            let code = DexCode {
                registers_size: 1,
                insns: vec![DexInstruction::new(DexOpcode::Const4).with_regs(&[0]), DexInstruction::new(DexOpcode::ReturnVoid)],
                ..DexCode::default()
            };
            def.make_concrete(DexAccessFlags::STATIC, Some(code), false).unwrap();
            cls.add_method(def).unwrap();
        }
        cls
    }

    #[test]
    fn sequential_and_parallel_walks_agree() {
        let mut classes = vec![build("Lwalk/A;", &["a:()V", "b:()V"]), build("Lwalk/B;", &["c:()V"])];
        methods_mut(&mut classes, |m| m.balloon()).unwrap();

        let scope: Vec<&DexClass> = classes.iter().collect();
        let mut seen = 0;
        methods(&scope, |_| seen += 1);
        assert_eq!(seen, 3);

        let mut insns = 0;
        opcodes(&scope, |_, _| insns += 1);
        assert_eq!(insns, 6);
        let total = parallel::reduce_methods(&scope, |m| m.get_code().map_or(0, |c| c.count_opcodes()), |a, b| a + b);
        assert_eq!(total, 6);
    }

    #[test]
    fn parallel_failures_are_aggregated() {
        let mut classes = vec![build("Lwalk/C;", &["a:()V"]), build("Lwalk/D;", &["b:()V", "c:()V"])];
        // Nothing is ballooned yet, so every sync fails.
        let err = parallel::methods_mut(&mut classes, |m| m.sync()).unwrap_err();
        match err.kind() {
            ErrorKind::AggregateWorker(errs) => assert_eq!(errs.len(), 3),
            other => panic!("unexpected kind {:?}", other),
        }
        parallel::methods_mut(&mut classes, |m| m.balloon()).unwrap();
    }
}
