use crate::ir::{Block, LoopNest, Stmt, Var};

/// One executed block instance: the block's name and the values of its iteration variables.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Instance {
    pub block: String,
    pub point: Vec<i32>,
}

impl LoopNest {
    /// Enumerates the block instances the nest executes, in execution order.
    ///
    /// An instance executes when every iteration value lies in its variable's domain and every
    /// predicate holds. Annotations do not affect the result.
    pub fn instances(&self) -> Vec<Instance> {
        let mut env = vec![0i32; self.var_names.len()];
        let mut out = vec![];
        for stmts in &self.exprs {
            run(stmts, &mut env, &mut out);
        }
        out
    }

    /// The instances of the named block, sorted and with recomputed duplicates removed.
    pub fn instance_set(&self, block_name: &str) -> Vec<Vec<i32>> {
        let mut points = self
            .instances()
            .into_iter()
            .filter(|inst| inst.block == block_name)
            .map(|inst| inst.point)
            .collect::<Vec<_>>();
        points.sort_unstable();
        points.dedup();
        points
    }
}

fn run(stmts: &[Stmt], env: &mut Vec<i32>, out: &mut Vec<Instance>) {
    for stmt in stmts {
        match stmt {
            Stmt::Loop(l) => {
                for i in 0..l.extent() as i32 {
                    env[l.var.id() as usize] = i;
                    run(&l.body, env, out);
                }
            }
            Stmt::Block(b) => {
                if let Some(point) = evaluate(b, env) {
                    out.push(Instance {
                        block: b.name.clone(),
                        point,
                    });
                }
            }
        }
    }
}

fn evaluate(block: &Block, env: &[i32]) -> Option<Vec<i32>> {
    let lookup = |v: &Var| env[v.id() as usize];
    if !block
        .predicates
        .iter()
        .all(|p| p.expr.eval(&lookup) < p.bound)
    {
        return None;
    }
    let mut point = Vec::with_capacity(block.iters.len());
    for (iv, value) in block.iters.iter().zip(&block.values) {
        let v = value.eval(&lookup);
        if v < 0 || v >= iv.var.extent() as i32 {
            return None;
        }
        point.push(v);
    }
    Some(point)
}
