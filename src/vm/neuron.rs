//! Per-neuron compiler - one neuron's contribution to the three kernels
//!
//! Visits a single neuron of the object graph and appends its feed, trace
//! and train fragments to fresh kernel sentences, allocating buffer slots
//! through the shared [`TrainingContext`] as it goes. Slot allocation order
//! matters: the first allocation of a key fixes the slot's initial value, so
//! the order below (rate, activation, derivative, then the state family) is
//! kept stable.
//!
//! The emitted arithmetic is real-time recurrent learning with gated
//! self-connections: eligibility traces per incoming connection, extended
//! eligibility traces per (gated neighbour, incoming connection), and an
//! error responsibility split into projected and gating activity for neurons
//! that both project and gate.

use crate::graph::{Network, NeuronIdx};
use crate::ids::Id;
use crate::vm::sentence::{KernelSentence, Op, Slot};
use crate::vm::variables::{TrainingContext, VarKey, VarRole};

/// What a neuron contributes to, decided by its position in the network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Activation is written from outside; contributes nothing to the kernels
    Input,
    /// Feeds, traces, and trains
    Hidden,
    /// Like Hidden, but its responsibility comes from a registered target
    Output,
    /// Feeds (including the gains it drives) but never learns
    Frozen,
}

/// A single neuron's kernel fragments
#[derive(Debug, Default)]
pub(crate) struct CompiledNeuron {
    pub feed: KernelSentence,
    pub trace: KernelSentence,
    pub train: KernelSentence,
}

impl CompiledNeuron {
    pub(crate) fn build(
        ctx: &mut TrainingContext,
        net: &Network,
        idx: NeuronIdx,
        role: Role,
    ) -> Self {
        let mut compiled = Self::default();
        let neuron = net.neuron(idx);
        let data = &neuron.data;

        let rate = ctx.allocate_or_reuse(0.0, VarKey::rate());
        ctx.register_rate(rate);
        let activation =
            ctx.allocate_or_reuse(data.activation, VarKey::of(neuron.id, VarRole::Activation));
        let derivative =
            ctx.allocate_or_reuse(data.derivative, VarKey::of(neuron.id, VarRole::Derivative));

        if role == Role::Input {
            ctx.register_input(activation);
            return compiled;
        }

        let bias = ctx.allocate_or_reuse(data.bias, VarKey::of(neuron.id, VarRole::Bias));
        let state = ctx.allocate_or_reuse(data.state, VarKey::of(neuron.id, VarRole::State));
        let old_state =
            ctx.allocate_or_reuse(data.old_state, VarKey::of(neuron.id, VarRole::OldState));

        let mut self_weight = None;
        let mut self_gain = None;
        if let Some(sc) = neuron.self_connection {
            let c = net.connection(sc);
            self_weight = Some(ctx.allocate_or_reuse(c.weight, VarKey::of(c.id, VarRole::Weight)));
            if c.gate.is_some() {
                self_gain = Some(ctx.allocate_or_reuse(c.gain, VarKey::of(c.id, VarRole::Gain)));
            }
        }

        // ---------------------------------------------------------------------
        // Feed: state from self-connection and bias, then incoming, then the
        // activation pair, then the gains this neuron drives
        // ---------------------------------------------------------------------

        compiled.feed.push(Op::Set {
            dst: old_state,
            src: state,
        });
        match (self_weight, self_gain) {
            (Some(sw), Some(sg)) => {
                compiled.feed.push(Op::MulAssign { dst: state, src: sw });
                compiled.feed.push(Op::MulAssign { dst: state, src: sg });
                compiled.feed.push(Op::AddAssign {
                    dst: state,
                    src: bias,
                });
            }
            (Some(sw), None) => compiled.feed.push(Op::MulAdd {
                dst: state,
                a: sw,
                b: state,
                c: bias,
            }),
            _ => compiled.feed.push(Op::Set {
                dst: state,
                src: bias,
            }),
        }
        for &ci in &neuron.incoming {
            let c = net.connection(ci);
            let source = net.neuron(c.source);
            let input_activation = ctx
                .allocate_or_reuse(source.data.activation, VarKey::of(source.id, VarRole::Activation));
            let input_weight =
                ctx.allocate_or_reuse(c.weight, VarKey::of(c.id, VarRole::Weight));
            if c.gate.is_some() {
                let input_gain = ctx.allocate_or_reuse(c.gain, VarKey::of(c.id, VarRole::Gain));
                compiled.feed.push(Op::MulAcc3 {
                    dst: state,
                    a: input_activation,
                    b: input_weight,
                    c: input_gain,
                });
            } else {
                compiled.feed.push(Op::MulAcc {
                    dst: state,
                    a: input_activation,
                    b: input_weight,
                });
            }
        }
        compiled.feed.push(Op::Sigmoid {
            dst: activation,
            src: state,
        });
        compiled.feed.push(Op::SigmoidDeriv {
            dst: derivative,
            src: activation,
        });
        for &gi in &neuron.gated {
            let g = net.connection(gi);
            let gain = ctx.allocate_or_reuse(g.gain, VarKey::of(g.id, VarRole::Gain));
            compiled.feed.push(Op::Set {
                dst: gain,
                src: activation,
            });
        }

        if role == Role::Frozen {
            return compiled;
        }

        // ---------------------------------------------------------------------
        // Trace: per-neighbour influence, then eligibility and extended
        // traces per incoming connection
        // ---------------------------------------------------------------------

        for &nb_id in neuron.extended.keys() {
            let influence = ctx.allocate_or_reuse(0.0, VarKey::of(nb_id, VarRole::Influence));
            let neighbour = net.neuron(neuron.neighbours[&nb_id]);
            let neighbour_old = ctx.allocate_or_reuse(
                neighbour.data.old_state,
                VarKey::of(nb_id, VarRole::OldState),
            );
            // a neighbour whose self-connection is gated here keeps its old
            // state in the influence
            let mut initialized = false;
            if let Some(sc) = neighbour.self_connection {
                if net.connection(sc).gate == Some(idx) {
                    compiled.trace.push(Op::Set {
                        dst: influence,
                        src: neighbour_old,
                    });
                    initialized = true;
                }
            }
            for &ci in &neuron.influences[&nb_id] {
                let c = net.connection(ci);
                let weight = ctx.allocate_or_reuse(c.weight, VarKey::of(c.id, VarRole::Weight));
                let source = net.neuron(c.source);
                let source_activation = ctx.allocate_or_reuse(
                    source.data.activation,
                    VarKey::of(source.id, VarRole::Activation),
                );
                if initialized {
                    compiled.trace.push(Op::MulAcc {
                        dst: influence,
                        a: weight,
                        b: source_activation,
                    });
                } else {
                    compiled.trace.push(Op::Mul {
                        dst: influence,
                        a: weight,
                        b: source_activation,
                    });
                    initialized = true;
                }
            }
        }

        for &ci in &neuron.incoming {
            let c = net.connection(ci);
            let input_gain = if c.gate.is_some() {
                Some(ctx.allocate_or_reuse(c.gain, VarKey::of(c.id, VarRole::Gain)))
            } else {
                None
            };
            let source = net.neuron(c.source);
            let input_activation = ctx
                .allocate_or_reuse(source.data.activation, VarKey::of(source.id, VarRole::Activation));
            let eligibility = ctx.allocate_or_reuse(
                neuron.eligibility[&c.id],
                VarKey::pair(neuron.id, c.id, VarRole::Eligibility),
            );
            match (self_weight, self_gain, input_gain) {
                (Some(sw), Some(sg), Some(ig)) => {
                    compiled.trace.push(Op::MulAssign {
                        dst: eligibility,
                        src: sw,
                    });
                    compiled.trace.push(Op::MulAssign {
                        dst: eligibility,
                        src: sg,
                    });
                    compiled.trace.push(Op::MulAcc {
                        dst: eligibility,
                        a: ig,
                        b: input_activation,
                    });
                }
                (Some(sw), Some(sg), None) => {
                    compiled.trace.push(Op::MulAssign {
                        dst: eligibility,
                        src: sw,
                    });
                    compiled.trace.push(Op::MulAssign {
                        dst: eligibility,
                        src: sg,
                    });
                    compiled.trace.push(Op::AddAssign {
                        dst: eligibility,
                        src: input_activation,
                    });
                }
                (Some(sw), None, Some(ig)) => {
                    compiled.trace.push(Op::MulAssign {
                        dst: eligibility,
                        src: sw,
                    });
                    compiled.trace.push(Op::MulAcc {
                        dst: eligibility,
                        a: ig,
                        b: input_activation,
                    });
                }
                (Some(sw), None, None) => compiled.trace.push(Op::MulAdd {
                    dst: eligibility,
                    a: sw,
                    b: eligibility,
                    c: input_activation,
                }),
                (None, _, Some(ig)) => compiled.trace.push(Op::Mul {
                    dst: eligibility,
                    a: ig,
                    b: input_activation,
                }),
                (None, _, None) => compiled.trace.push(Op::Set {
                    dst: eligibility,
                    src: input_activation,
                }),
            }
            for (&nb_id, xtrace) in &neuron.extended {
                let influence = ctx.allocate_or_reuse(0.0, VarKey::of(nb_id, VarRole::Influence));
                let extended = ctx.allocate_or_reuse(
                    xtrace[&c.id],
                    VarKey::triple(neuron.id, nb_id, c.id, VarRole::ExtendedTrace),
                );
                match (self_weight, self_gain) {
                    (Some(sw), Some(sg)) => {
                        compiled.trace.push(Op::MulAssign {
                            dst: extended,
                            src: sw,
                        });
                        compiled.trace.push(Op::MulAssign {
                            dst: extended,
                            src: sg,
                        });
                        compiled.trace.push(Op::MulAcc3 {
                            dst: extended,
                            a: derivative,
                            b: eligibility,
                            c: influence,
                        });
                    }
                    (Some(sw), None) => {
                        compiled.trace.push(Op::MulAssign {
                            dst: extended,
                            src: sw,
                        });
                        compiled.trace.push(Op::MulAcc3 {
                            dst: extended,
                            a: derivative,
                            b: eligibility,
                            c: influence,
                        });
                    }
                    _ => {
                        compiled.trace.push(Op::Mul {
                            dst: extended,
                            a: derivative,
                            b: eligibility,
                        });
                        compiled.trace.push(Op::MulAssign {
                            dst: extended,
                            src: influence,
                        });
                    }
                }
            }
        }

        // ---------------------------------------------------------------------
        // Train: error responsibility by role, weight updates, bias update
        // ---------------------------------------------------------------------

        let responsibility = ctx.allocate_or_reuse(
            data.error_responsibility,
            VarKey::of(neuron.id, VarRole::ErrorResponsibility),
        );

        if role == Role::Output {
            let target = ctx.allocate_or_reuse(0.0, VarKey::of(neuron.id, VarRole::Target));
            ctx.register_target(target);
            ctx.register_output(activation);
            compiled.train.push(Op::Sub {
                dst: responsibility,
                a: target,
                b: activation,
            });
            for &ci in &neuron.incoming {
                let c = net.connection(ci);
                let eligibility = ctx.allocate_or_reuse(
                    neuron.eligibility[&c.id],
                    VarKey::pair(neuron.id, c.id, VarRole::Eligibility),
                );
                let weight = ctx.allocate_or_reuse(c.weight, VarKey::of(c.id, VarRole::Weight));
                compiled.train.push(Op::MulAcc3 {
                    dst: weight,
                    a: rate,
                    b: responsibility,
                    c: eligibility,
                });
            }
        } else {
            let no_outgoing = neuron.outgoing.is_empty();
            let no_gates = neuron.gated.is_empty();
            if !no_outgoing && !no_gates {
                // projects and gates: responsibility splits into projected
                // and gating activity
                let accumulator =
                    ctx.allocate_or_reuse(0.0, VarKey::scratch(VarRole::ErrorAccumulator));
                compiled.train.push(Op::Imm {
                    dst: accumulator,
                    value: 0.0,
                });
                Self::emit_projected_sum(ctx, net, neuron.outgoing.as_slice(), accumulator, &mut compiled.train);
                let projected = ctx.allocate_or_reuse(
                    data.projected_activity,
                    VarKey::of(neuron.id, VarRole::ProjectedActivity),
                );
                compiled.train.push(Op::Mul {
                    dst: projected,
                    a: derivative,
                    b: accumulator,
                });
                compiled.train.push(Op::Imm {
                    dst: accumulator,
                    value: 0.0,
                });
                for &nb_id in neuron.extended.keys() {
                    let influence_temp =
                        Self::emit_influence_temp(ctx, net, idx, nb_id, &mut compiled.train);
                    let neighbour = net.neuron(neuron.neighbours[&nb_id]);
                    let neighbour_responsibility = ctx.allocate_or_reuse(
                        neighbour.data.error_responsibility,
                        VarKey::of(nb_id, VarRole::ErrorResponsibility),
                    );
                    compiled.train.push(Op::MulAcc {
                        dst: accumulator,
                        a: neighbour_responsibility,
                        b: influence_temp,
                    });
                }
                let gating = ctx.allocate_or_reuse(
                    data.gating_activity,
                    VarKey::of(neuron.id, VarRole::GatingActivity),
                );
                compiled.train.push(Op::Mul {
                    dst: gating,
                    a: derivative,
                    b: accumulator,
                });
                compiled.train.push(Op::Add {
                    dst: responsibility,
                    a: projected,
                    b: gating,
                });
                for &ci in &neuron.incoming {
                    let c = net.connection(ci);
                    let gradient =
                        ctx.allocate_or_reuse(0.0, VarKey::scratch(VarRole::Gradient));
                    let eligibility = ctx.allocate_or_reuse(
                        neuron.eligibility[&c.id],
                        VarKey::pair(neuron.id, c.id, VarRole::Eligibility),
                    );
                    compiled.train.push(Op::Mul {
                        dst: gradient,
                        a: projected,
                        b: eligibility,
                    });
                    Self::emit_extended_gradient(ctx, net, neuron.id, c.id, &mut compiled.train, gradient, &neuron.extended, &neuron.neighbours);
                    let weight =
                        ctx.allocate_or_reuse(c.weight, VarKey::of(c.id, VarRole::Weight));
                    compiled.train.push(Op::MulAcc {
                        dst: weight,
                        a: rate,
                        b: gradient,
                    });
                }
            } else if no_gates {
                // plain hidden neuron: projected error only
                compiled.train.push(Op::Imm {
                    dst: responsibility,
                    value: 0.0,
                });
                Self::emit_projected_sum(ctx, net, neuron.outgoing.as_slice(), responsibility, &mut compiled.train);
                compiled.train.push(Op::MulAssign {
                    dst: responsibility,
                    src: derivative,
                });
                for &ci in &neuron.incoming {
                    let c = net.connection(ci);
                    let eligibility = ctx.allocate_or_reuse(
                        neuron.eligibility[&c.id],
                        VarKey::pair(neuron.id, c.id, VarRole::Eligibility),
                    );
                    let weight =
                        ctx.allocate_or_reuse(c.weight, VarKey::of(c.id, VarRole::Weight));
                    compiled.train.push(Op::MulAcc3 {
                        dst: weight,
                        a: rate,
                        b: responsibility,
                        c: eligibility,
                    });
                }
            } else {
                // pure gater: gating error only
                compiled.train.push(Op::Imm {
                    dst: responsibility,
                    value: 0.0,
                });
                for &nb_id in neuron.extended.keys() {
                    let influence_temp =
                        Self::emit_influence_temp(ctx, net, idx, nb_id, &mut compiled.train);
                    let neighbour = net.neuron(neuron.neighbours[&nb_id]);
                    let neighbour_responsibility = ctx.allocate_or_reuse(
                        neighbour.data.error_responsibility,
                        VarKey::of(nb_id, VarRole::ErrorResponsibility),
                    );
                    compiled.train.push(Op::MulAcc {
                        dst: responsibility,
                        a: neighbour_responsibility,
                        b: influence_temp,
                    });
                }
                compiled.train.push(Op::MulAssign {
                    dst: responsibility,
                    src: derivative,
                });
                for &ci in &neuron.incoming {
                    let c = net.connection(ci);
                    let gradient =
                        ctx.allocate_or_reuse(0.0, VarKey::scratch(VarRole::Gradient));
                    compiled.train.push(Op::Imm {
                        dst: gradient,
                        value: 0.0,
                    });
                    Self::emit_extended_gradient(ctx, net, neuron.id, c.id, &mut compiled.train, gradient, &neuron.extended, &neuron.neighbours);
                    let weight =
                        ctx.allocate_or_reuse(c.weight, VarKey::of(c.id, VarRole::Weight));
                    compiled.train.push(Op::MulAcc {
                        dst: weight,
                        a: rate,
                        b: gradient,
                    });
                }
            }
        }

        compiled.train.push(Op::MulAcc {
            dst: bias,
            a: rate,
            b: responsibility,
        });

        compiled
    }

    /// `dst += responsibility(B) * [gain *] weight` over outgoing connections
    fn emit_projected_sum(
        ctx: &mut TrainingContext,
        net: &Network,
        outgoing: &[usize],
        dst: Slot,
        train: &mut KernelSentence,
    ) {
        for &oi in outgoing {
            let c = net.connection(oi);
            let target = net.neuron(c.target);
            let weight = ctx.allocate_or_reuse(c.weight, VarKey::of(c.id, VarRole::Weight));
            let target_responsibility = ctx.allocate_or_reuse(
                target.data.error_responsibility,
                VarKey::of(target.id, VarRole::ErrorResponsibility),
            );
            if c.gate.is_some() {
                let gain = ctx.allocate_or_reuse(c.gain, VarKey::of(c.id, VarRole::Gain));
                train.push(Op::MulAcc3 {
                    dst,
                    a: target_responsibility,
                    b: gain,
                    c: weight,
                });
            } else {
                train.push(Op::MulAcc {
                    dst,
                    a: target_responsibility,
                    b: weight,
                });
            }
        }
    }

    /// Build the shared influence scratch for one gated neighbour
    fn emit_influence_temp(
        ctx: &mut TrainingContext,
        net: &Network,
        gater: NeuronIdx,
        neighbour_id: Id,
        train: &mut KernelSentence,
    ) -> Slot {
        let neuron = net.neuron(gater);
        let influence_temp = ctx.allocate_or_reuse(0.0, VarKey::scratch(VarRole::Influence));
        let neighbour = net.neuron(neuron.neighbours[&neighbour_id]);
        let neighbour_old = ctx.allocate_or_reuse(
            neighbour.data.old_state,
            VarKey::of(neighbour_id, VarRole::OldState),
        );
        let self_gated_here = neighbour
            .self_connection
            .is_some_and(|sc| net.connection(sc).gate == Some(gater));
        if self_gated_here {
            train.push(Op::Set {
                dst: influence_temp,
                src: neighbour_old,
            });
        } else {
            train.push(Op::Imm {
                dst: influence_temp,
                value: 0.0,
            });
        }
        for &ci in &neuron.influences[&neighbour_id] {
            let c = net.connection(ci);
            let weight = ctx.allocate_or_reuse(c.weight, VarKey::of(c.id, VarRole::Weight));
            let source = net.neuron(c.source);
            let source_activation = ctx.allocate_or_reuse(
                source.data.activation,
                VarKey::of(source.id, VarRole::Activation),
            );
            train.push(Op::MulAcc {
                dst: influence_temp,
                a: weight,
                b: source_activation,
            });
        }
        influence_temp
    }

    /// `gradient += responsibility(N) * extended_trace(N, C)` over neighbours
    #[allow(clippy::too_many_arguments)]
    fn emit_extended_gradient(
        ctx: &mut TrainingContext,
        net: &Network,
        neuron_id: Id,
        conn_id: Id,
        train: &mut KernelSentence,
        gradient: Slot,
        extended: &std::collections::BTreeMap<Id, std::collections::BTreeMap<Id, f64>>,
        neighbours: &std::collections::BTreeMap<Id, NeuronIdx>,
    ) {
        for (&nb_id, xtrace) in extended {
            let neighbour = net.neuron(neighbours[&nb_id]);
            let neighbour_responsibility = ctx.allocate_or_reuse(
                neighbour.data.error_responsibility,
                VarKey::of(nb_id, VarRole::ErrorResponsibility),
            );
            let extended_trace = ctx.allocate_or_reuse(
                xtrace[&conn_id],
                VarKey::triple(neuron_id, nb_id, conn_id, VarRole::ExtendedTrace),
            );
            train.push(Op::MulAcc {
                dst: gradient,
                a: neighbour_responsibility,
                b: extended_trace,
            });
        }
    }
}
