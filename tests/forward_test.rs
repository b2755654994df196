use approx::assert_abs_diff_eq;
use packed_gru::activations::sigmoid;
use packed_gru::{
    BatchProfile, Direction, ForwardBuffers, Gate, GruConfig, GruError, GruReference, InputMode,
    Layout, ReferenceCase, forward,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn random_vec(rng: &mut StdRng, len: usize, scale: f32) -> Vec<f32> {
    (0..len).map(|_| rng.random_range(-scale..scale)).collect()
}

#[test]
fn test_single_step_literal_value() {
    // H = 1, input width 1, z/r/n input weights 1, hidden weights 0, hx 0
    let gru = GruReference::new(GruConfig::new(1, 1, 1), &BatchProfile::uniform(1, 1).unwrap())
        .unwrap();
    assert_eq!(gru.params_len(), 6);

    let pass = gru
        .forward(&[1.0, 1.0, 1.0, 0.0, 0.0, 0.0], &[1.0], &[0.0])
        .unwrap();
    assert_abs_diff_eq!(pass.output[0], 0.2048, epsilon = 1e-4);
    assert_eq!(pass.hy[0], pass.output[0]);
}

#[test]
fn test_forward_is_deterministic() {
    let config = GruConfig::new(4, 2, 3).bidirectional().with_bias(true);
    let profile = BatchProfile::new(vec![3, 3, 2, 1]).unwrap();
    let gru = GruReference::new(config, &profile).unwrap();

    let mut rng = StdRng::seed_from_u64(11);
    let weights = random_vec(&mut rng, gru.params_len(), 0.5);
    let input = random_vec(&mut rng, gru.input_len(), 1.0);
    let hx = random_vec(&mut rng, gru.hidden_len(), 1.0);

    let first = gru.forward(&weights, &input, &hx).unwrap();
    let second = gru.forward(&weights, &input, &hx).unwrap();
    assert_eq!(first.output, second.output);
    assert_eq!(first.hy, second.hy);
    assert_eq!(first.reserve, second.reserve);
}

#[test]
fn test_forward_overwrites_stale_buffers() {
    let config = GruConfig::new(2, 2, 2).with_bias(true);
    let layout = Layout::new(&config, &BatchProfile::new(vec![2, 1]).unwrap()).unwrap();
    let mut rng = StdRng::seed_from_u64(5);
    let weights = random_vec(&mut rng, layout.params_len(), 0.5);
    let input = random_vec(&mut rng, layout.input_len(), 1.0);
    let hx = random_vec(&mut rng, layout.hidden_len(), 1.0);

    let run = |fill: f32| {
        let mut output = vec![fill; layout.output_len()];
        let mut hy = vec![fill; layout.hidden_len()];
        let mut reserve = vec![fill; layout.reserve_len()];
        forward(
            &layout,
            &weights,
            &input,
            &hx,
            ForwardBuffers {
                output: &mut output,
                hy: &mut hy,
                reserve: &mut reserve,
            },
        )
        .unwrap();
        (output, hy, reserve)
    };
    assert_eq!(run(0.0), run(123.0));
}

#[test]
fn test_empty_trailing_timestep() {
    let config = GruConfig::new(2, 2, 3).bidirectional().with_bias(true);
    let profile = BatchProfile::new(vec![2, 0]).unwrap();
    let mut rng = StdRng::seed_from_u64(21);
    let case = ReferenceCase::random(config, profile, &mut rng).unwrap();
    let gru = case.engine().unwrap();
    let layout = gru.layout();
    let h = layout.hidden();

    let pass = gru.forward(&case.weights, &case.input, &case.hx).unwrap();
    // no row reaches the last timestep, so no forward final state survives
    for layer in 0..layout.layers() {
        let base = layout.hidden_base(layer, Direction::Forward);
        assert!(pass.hy[base..base + 2 * h].iter().all(|&v| v == 0.0));
        let base = layout.hidden_base(layer, Direction::Reverse);
        assert!(pass.hy[base..base + 2 * h].iter().any(|&v| v != 0.0));
    }

    let outputs = case.run().unwrap();
    assert_eq!(outputs.output, pass.output);
    assert!(outputs.dweights.iter().all(|v| v.is_finite()));
}

/// Builds bidirectional weights whose forward half equals `uni`
fn embed_forward_half(
    uni_layout: &Layout,
    uni: &[f32],
    bi_layout: &Layout,
    rng: &mut StdRng,
) -> Vec<f32> {
    let mut bi = random_vec(rng, bi_layout.params_len(), 0.5);
    let h = uni_layout.hidden();

    let src = uni_layout.input_weights(0).unwrap();
    let dst = bi_layout.input_weights(0).unwrap();
    let len = src.rows * src.cols;
    bi[dst.offset..dst.offset + len].copy_from_slice(&uni[src.offset..src.offset + len]);

    let src = uni_layout.hidden_weights(0, Direction::Forward, Gate::Update, 3);
    let dst = bi_layout.hidden_weights(0, Direction::Forward, Gate::Update, 3);
    let len = 3 * h * h;
    bi[dst.offset..dst.offset + len].copy_from_slice(&uni[src.offset..src.offset + len]);

    for (src, dst) in [
        (uni_layout.input_bias(0), bi_layout.input_bias(0)),
        (uni_layout.recurrent_bias(0), bi_layout.recurrent_bias(0)),
    ] {
        let (src, dst) = (src.unwrap(), dst.unwrap());
        bi[dst..dst + 3 * h].copy_from_slice(&uni[src..src + 3 * h]);
    }
    bi
}

#[test]
fn test_bidirectional_forward_half_matches_unidirectional() {
    let h = 3;
    let profile = BatchProfile::new(vec![3, 2, 2, 1]).unwrap();
    let uni_config = GruConfig::new(h, 1, 4).with_bias(true);
    let bi_config = uni_config.clone().bidirectional();
    let uni = GruReference::new(uni_config, &profile).unwrap();
    let bi = GruReference::new(bi_config, &profile).unwrap();

    let mut rng = StdRng::seed_from_u64(21);
    let uni_weights = random_vec(&mut rng, uni.params_len(), 0.5);
    let bi_weights = embed_forward_half(uni.layout(), &uni_weights, bi.layout(), &mut rng);
    let input = random_vec(&mut rng, uni.input_len(), 1.0);
    let uni_hx = random_vec(&mut rng, uni.hidden_len(), 1.0);
    let mut bi_hx = random_vec(&mut rng, bi.hidden_len(), 1.0);
    bi_hx[..uni_hx.len()].copy_from_slice(&uni_hx);

    let uni_pass = uni.forward(&uni_weights, &input, &uni_hx).unwrap();
    let bi_pass = bi.forward(&bi_weights, &input, &bi_hx).unwrap();

    for row in 0..profile.total() {
        assert_eq!(
            &bi_pass.output[row * 2 * h..row * 2 * h + h],
            &uni_pass.output[row * h..(row + 1) * h],
            "row {}",
            row
        );
    }
    assert_eq!(&bi_pass.hy[..uni_pass.hy.len()], &uni_pass.hy[..]);
}

#[test]
fn test_saturated_reset_gate_hides_candidate_block() {
    let config = GruConfig::new(3, 2, 2).with_bias(true);
    let profile = BatchProfile::new(vec![2, 2, 1]).unwrap();
    let gru = GruReference::new(config, &profile).unwrap();
    let layout = gru.layout();

    let mut rng = StdRng::seed_from_u64(3);
    let mut weights = random_vec(&mut rng, gru.params_len(), 0.5);
    let input = random_vec(&mut rng, gru.input_len(), 1.0);
    let hx = random_vec(&mut rng, gru.hidden_len(), 1.0);

    for layer in 0..layout.layers() {
        let ib = layout.input_bias(layer).unwrap();
        for j in 0..layout.hidden() {
            weights[layout.bias_index(ib, Direction::Forward, Gate::Reset, j)] = -1.0e4;
        }
    }
    let saturated = gru.forward(&weights, &input, &hx).unwrap();

    for layer in 0..layout.layers() {
        let block = layout.hidden_weights(layer, Direction::Forward, Gate::Candidate, 1);
        weights[block.offset..block.offset + block.rows * block.cols].fill(0.0);
    }
    let without_candidate = gru.forward(&weights, &input, &hx).unwrap();

    assert_eq!(saturated.output, without_candidate.output);
    assert_eq!(saturated.hy, without_candidate.hy);
}

#[test]
fn test_no_leakage_between_sequences() {
    for config in [
        GruConfig::new(2, 2, 3).with_bias(true),
        GruConfig::new(2, 2, 3).with_bias(true).bidirectional(),
    ] {
        // sequence 0 spans both timesteps (packed rows 0 and 2), sequence 1 only t = 0 (row 1)
        let profile = BatchProfile::new(vec![2, 1]).unwrap();
        let gru = GruReference::new(config, &profile).unwrap();
        let layout = gru.layout();
        let mut rng = StdRng::seed_from_u64(8);
        let weights = random_vec(&mut rng, gru.params_len(), 0.5);
        let input = random_vec(&mut rng, gru.input_len(), 1.0);
        let hx = random_vec(&mut rng, gru.hidden_len(), 1.0);
        let before = gru.forward(&weights, &input, &hx).unwrap();

        let mut input2 = input.clone();
        for v in &mut input2[3..6] {
            *v += 0.75;
        }
        let mut hx2 = hx.clone();
        for layer in 0..layout.layers() {
            for dir in layout.directions() {
                for j in 0..layout.hidden() {
                    hx2[layout.hidden_index(layer, dir, 1, j)] -= 0.5;
                }
            }
        }
        let after = gru.forward(&weights, &input2, &hx2).unwrap();

        let w = layout.output_width();
        assert_ne!(before.output[w..2 * w], after.output[w..2 * w]);
        assert_eq!(before.output[..w], after.output[..w]);
        assert_eq!(before.output[2 * w..3 * w], after.output[2 * w..3 * w]);
        for layer in 0..layout.layers() {
            for dir in layout.directions() {
                let base = layout.hidden_base(layer, dir);
                assert_eq!(before.hy[base..base + 2], after.hy[base..base + 2]);
            }
        }
    }
}

#[test]
fn test_skip_input_enters_every_gate() {
    let config = GruConfig::new(2, 1, 2).with_input_mode(InputMode::Skip);
    let gru = GruReference::new(config, &BatchProfile::uniform(1, 1).unwrap()).unwrap();
    // no input block: only the hidden block, zeroed
    assert_eq!(gru.params_len(), 6 * 2);
    let weights = vec![0.0; gru.params_len()];
    let input = [0.3, -0.6];
    let hx = [0.5, 0.25];
    let pass = gru.forward(&weights, &input, &hx).unwrap();

    for j in 0..2 {
        let x: f32 = input[j];
        let z = sigmoid(x);
        let expected = (1.0 - z) * x.tanh() + z * hx[j];
        assert_abs_diff_eq!(pass.output[j], expected, epsilon = 1e-6);
    }
}

#[test]
fn test_skip_width_mismatch_fails_before_any_work() {
    let config = GruConfig::new(3, 1, 2).with_input_mode(InputMode::Skip);
    let err = GruReference::new(config, &BatchProfile::uniform(2, 2).unwrap()).unwrap_err();
    assert!(matches!(
        err,
        GruError::SkipInputWidth {
            input_width: 2,
            hidden_size: 3
        }
    ));
}

#[test]
fn test_output_width_truncates_concatenated_hidden() {
    let profile = BatchProfile::new(vec![2, 1]).unwrap();
    let full = GruReference::new(GruConfig::new(2, 1, 2).bidirectional(), &profile).unwrap();
    let narrow = GruReference::new(
        GruConfig::new(2, 1, 2).bidirectional().with_output_width(3),
        &profile,
    )
    .unwrap();
    assert_eq!(narrow.output_len(), 3 * 3);

    let mut rng = StdRng::seed_from_u64(2);
    let weights = random_vec(&mut rng, full.params_len(), 0.5);
    let input = random_vec(&mut rng, full.input_len(), 1.0);
    let hx = random_vec(&mut rng, full.hidden_len(), 1.0);
    let wide = full.forward(&weights, &input, &hx).unwrap();
    let cut = narrow.forward(&weights, &input, &hx).unwrap();

    for row in 0..3 {
        assert_eq!(cut.output[row * 3..row * 3 + 3], wide.output[row * 4..row * 4 + 3]);
    }
}
