//! Theoretical background.
//!
//! # Contents
//! - [Splitting](#splitting)
//! - [Kinetic pair rotations](#kinetic-pair-rotations)
//! - [Imaginary time](#imaginary-time)
//! - [Rotating frame](#rotating-frame)
//! - [Two components](#two-components)
//! - [Tiles and halos](#tiles-and-halos)
//! - [Four-sublattice layout](#four-sublattice-layout)
//!
//! # Splitting
//! In units where ħ = 1 the wave function evolves as
//! ```text
//!   ∂ψ
//! i -- = H ψ,    H = K + V
//!   ∂t
//! ```
//! with *K* = -∇²/2*m* and *V* collecting every term that is diagonal in
//! position (external potential and contact interactions). The exact
//! propagator *e*<sup>-*i* *H* *dt*</sup> is approximated by the symmetric
//! second-order Trotter-Suzuki product[^1]
//! ```text
//!  -i H dt     -i K dt/2  -i V dt  -i K dt/2
//! e         = e          e        e          + O(dt³)
//! ```
//! The potential factor is a pointwise phase. The kinetic factor is split
//! further, below, into products of operators that each act on disjoint pairs
//! of lattice sites, so that a whole step only ever touches a site and its
//! immediate neighbors.
//!
//! # Kinetic pair rotations
//! On a lattice with spacings *Δx*, *Δy*, the finite-difference kinetic
//! operator is a sum of hopping terms, one per link between adjacent sites.
//! Grouping links by direction (vertical or horizontal) and by the parity of
//! their first site gives four groups *K*<sub>v0</sub>, *K*<sub>v1</sub>,
//! *K*<sub>h0</sub>, *K*<sub>h1</sub>, each of which is a direct sum of
//! independent two-site blocks[^2]. Exponentiating one block gives a rotation
//! of the pair (*ψ*₁, *ψ*₂):
//! ```text
//! ψ₁' = a ψ₁ + i b ψ₂
//! ψ₂' = a ψ₂ + i b ψ₁
//!
//! a = cos θ,  b = sin θ,  θ = dt / (4 m Δx Δy)
//! ```
//! or, in real and imaginary parts,
//! ```text
//! r₁' = a r₁ - b i₂      i₁' = a i₁ + b r₂
//! r₂' = a r₂ - b i₁      i₂' = a i₂ + b r₁
//! ```
//! The diagonal part of the Laplacian only contributes a global phase and is
//! dropped. A full step is then the palindrome
//! ```text
//! v0 h0 v1 h1 [R] L [R'] h1 v1 h0 v0
//! ```
//! where *L* is the pointwise local factor and *R*, *R'* are the rotating-frame
//! sweeps described below. Every sweep is unitary, so real-time evolution of a
//! closed system conserves the norm exactly, and stepping with conjugated
//! coefficients (*b* → -*b*, and every phase negated) undoes a step.
//!
//! # Imaginary time
//! Substituting *t* → -*i* *τ* turns every factor into a contraction,
//! ```text
//! a = cosh θ,  b = sinh θ,  L = exp(-dt V)
//! ```
//! with the pair update *ψ*₁' = *a* *ψ*₁ + *b* *ψ*₂. Repeated steps suppress
//! every eigencomponent relative to the lowest one, so rescaling to unit norm
//! after each step converges to the ground state. The norm used throughout is
//! the discrete integral
//! ```text
//! N = Σ |ψ|² Δx Δy
//! ```
//! over owned sites only.
//!
//! # Rotating frame
//! In a frame rotating at angular velocity Ω about (*x*₀, *y*₀) the
//! Hamiltonian gains -Ω *L*<sub>z</sub>, with
//! ```text
//! L_z = -i (x ∂y - y ∂x)
//! ```
//! measured from the rotation centre. Discretized with central differences,
//! the ∂y part is again a sum of vertical hopping terms, now with an amplitude
//! proportional to the column's *x*; likewise for ∂x and rows. These are
//! applied as four more pair sweeps (two parities per axis) on either side of
//! the local factor, in mirrored order, each carrying half of *dt*. Their
//! rotation angles depend on position, so every block carries its global
//! offset. Because these links span two sites, one rotating-frame step reaches
//! further into the halo than a plain step and needs a wider halo.
//!
//! # Two components
//! Two species *a* and *b* each have their own mass, potential and
//! self-interaction *g*, and couple through
//! ```text
//! H_ab = g_ab |ψ_a|² |ψ_b|²  +  [ 0   Ω ] (Rabi)
//!                               [ Ω*  0 ]
//! ```
//! with a complex Rabi frequency Ω = Ω<sub>R</sub> + *i* Ω<sub>I</sub>. The
//! density coupling enters each component's local factor. The Rabi term
//! mixes the components pointwise; its exponential is exact,
//! ```text
//! exp(-i t H_R) = cos(|Ω| t) I - i sin(|Ω| t) H_R / |Ω|
//! exp(-t H_R)   = cosh(|Ω| t) I - sinh(|Ω| t) H_R / |Ω|
//! ```
//! and is applied for half a step before and after the two component steps.
//!
//! # Tiles and halos
//! The global lattice is cut into a nearly square grid of tiles, one per rank.
//! Every tile is padded by a halo on each edge that borders another tile or
//! wraps around a periodic axis. A step reads at most a fixed number of sites
//! beyond any site it writes, so as long as the halo is at least that wide,
//! the owned sites of a tile can be stepped with no communication at all.
//! Afterwards the halo is refreshed from the neighbors in two waves:
//! ```text
//!        wave 1: columns                 wave 2: rows
//!   +---+-----------+---+          +---+-----------+---+
//!   |   |           |   |          | <=====up=======>  |
//!   +---+-----------+---+          +---+-----------+---+
//!   | < |   owned   | > |          |   |   owned   |   |
//!   +---+-----------+---+          +---+-----------+---+
//!   |   |           |   |          | <=====down=====>  |
//!   +---+-----------+---+          +---+-----------+---+
//! ```
//! Row bands span the full tile width and so carry the column halos received
//! in the first wave: corners arrive from diagonal neighbors without diagonal
//! messages.
//!
//! Within a tile, work is done in overlapping blocks. Blocks that touch the
//! tile edge form the halo pass and are computed first, so that the first
//! wave can be posted while the interior blocks are still being computed[^3].
//!
//! # Four-sublattice layout
//! The vectorized kernel stores each plane as four quadrant planes holding the
//! sites of one (row parity, column parity) class. A pair sweep then always
//! combines a whole row of one quadrant with a whole row of another, possibly
//! shifted by one, so lanes never need to branch on parity.
//!
//! [^1]: M. Suzuki, "Fractal decomposition of exponential operators with
//! applications to many-body theories and Monte Carlo simulations." Physics
//! Letters A **146** 6 319-323 (1990).
//!
//! [^2]: C. S. Bederián and A. D. Dente, "Boosting quantum evolutions using
//! Trotter-Suzuki algorithms on GPUs." Proceedings of HPCLatAm-11 (2011).
//!
//! [^3]: P. Wittek and F. M. Cucchietti, "A second-order distributed
//! Trotter-Suzuki solver with a hybrid CPU-GPU kernel." Computer Physics
//! Communications **184** 4 1165-1171 (2013).
