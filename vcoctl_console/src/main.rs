use std::fmt;
use std::io::{self, BufRead, Write};

use embedded_hal::delay::DelayNs;
use vcoctl::capture::{FreqChannel, FreqTimer};
use vcoctl::config::{CorrectionConfig, OscillatorConfig, TickConfig, TuneConfig, VoltSpan};
use vcoctl::dispatch::{Dispatcher, EnvelopeId};
use vcoctl::envelope::{Callback, Envelope, EnvelopeControl, EnvelopeKind, Segment};
use vcoctl::sim::{SimBus, SimClock, SimCodes, SimOscillator};
use vcoctl::{Board, DacId, VcoId};
use wmidi::MidiMessage;

const VCOS: usize = 6;
/// First DAC channel of the amplitude outputs, one per oscillator
const VCA_DAC: u8 = 8;

static CODES: SimCodes = SimCodes::new();
static CHANNELS: [FreqChannel; VCOS] = [
    FreqChannel::new(0),
    FreqChannel::new(1),
    FreqChannel::new(2),
    FreqChannel::new(3),
    FreqChannel::new(4),
    FreqChannel::new(5),
];
static TIMERS: [FreqTimer<'static>; 2] = [
    FreqTimer::new(
        0,
        [
            Some(&CHANNELS[0]),
            Some(&CHANNELS[1]),
            Some(&CHANNELS[2]),
            Some(&CHANNELS[3]),
        ],
    ),
    FreqTimer::new(1, [Some(&CHANNELS[4]), Some(&CHANNELS[5]), None, None]),
];
static CONTROLS: [EnvelopeControl; VCOS + 1] = [
    EnvelopeControl::new(),
    EnvelopeControl::new(),
    EnvelopeControl::new(),
    EnvelopeControl::new(),
    EnvelopeControl::new(),
    EnvelopeControl::new(),
    EnvelopeControl::new(),
];

/// Pitch errors (offset, per octave) of the simulated oscillators, in codes
const ERRORS: [(f64, f64); VCOS] = [
    (35.0, 4.0),
    (-80.0, 10.0),
    (120.0, -6.0),
    (-15.0, 0.0),
    (60.0, 12.0),
    (-140.0, -3.0),
];

const HELP: &str = "\
d [vco]                    dump state, or one oscillator's landmarks
t                          tune every oscillator
c                          one correction pass on every oscillator
o <vco> <oct> <half>       set pitch
r <dac> <code>             write a raw code
s <ticks>                  run the envelope tick
x                          stop the envelope tick
p <env> <seg> <boct> <bhalf> <eoct> <ehalf> <intervals>
                           replace an envelope segment
m <hex bytes>              feed a MIDI message
h                          this help
q                          quit";

enum CommandError {
    Usage(&'static str),
    Core(vcoctl::Error),
    Midi(wmidi::FromBytesError),
}

impl From<vcoctl::Error> for CommandError {
    fn from(e: vcoctl::Error) -> Self {
        CommandError::Core(e)
    }
}

impl From<wmidi::FromBytesError> for CommandError {
    fn from(e: wmidi::FromBytesError) -> Self {
        CommandError::Midi(e)
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::Usage(usage) => write!(f, "usage: {}", usage),
            CommandError::Core(e) => write!(f, "{}", e),
            CommandError::Midi(e) => write!(f, "bad MIDI message: {:?}", e),
        }
    }
}

type CommandResult = Result<(), CommandError>;

struct Console {
    board: Board<'static, SimBus<'static>>,
    dispatcher: Dispatcher<'static>,
    clock: SimClock<'static>,
    tune: TuneConfig,
    vcos: [VcoId; VCOS],
}

fn numbers<const N: usize>(words: &[&str], usage: &'static str) -> Result<[u16; N], CommandError> {
    if words.len() != N {
        return Err(CommandError::Usage(usage));
    }
    let mut out = [0; N];
    for (o, w) in out.iter_mut().zip(words) {
        *o = w.parse().map_err(|_| CommandError::Usage(usage))?;
    }
    Ok(out)
}

impl Console {
    fn new() -> Result<Self, vcoctl::Error> {
        let mut board = Board::new(SimBus::new(&CODES), CorrectionConfig::default());
        let mut clock = SimClock::new(&CODES);
        let mut dispatcher = Dispatcher::new(TickConfig::default());
        let mut vcos = [VcoId(0); VCOS];
        for (i, vco) in vcos.iter_mut().enumerate() {
            let dac = board.add_dac(i as u8, VoltSpan::BIPOLAR_5)?;
            *vco = board.add_vco(dac, &CHANNELS[i], OscillatorConfig::default())?;
            let (offset, per_octave) = ERRORS[i];
            clock.add_oscillator(
                &TIMERS[i / 4],
                i % 4,
                i as u8,
                SimOscillator::with_error(offset, per_octave),
            )?;
            board.voct(dac, 5, 0, false)?;

            let vca = board.add_dac(VCA_DAC + i as u8, VoltSpan::UNIPOLAR_5)?;
            let mut adsr = Envelope::new(EnvelopeKind::Adsr, Some(vca), false, &CONTROLS[i]);
            adsr.add(Segment::new(0, 60000, 20, 1, Callback::None), None)?;
            adsr.add(Segment::new(60000, 40000, 10, 2, Callback::None), None)?;
            adsr.add(Segment::new(40000, 40000, 1, 1, Callback::None), None)?;
            adsr.add(Segment::new(40000, 0, 30, 2, Callback::None), None)?;
            // idle until the first note
            CONTROLS[i].stop();
            dispatcher.add(adsr)?;
        }
        let last = DacId(VCOS as u8 - 1);
        // a repeating pitch sweep on the last oscillator, envelope VCOS
        let mut sweep = Envelope::new(EnvelopeKind::Plain, Some(last), true, &CONTROLS[VCOS]);
        let conv = board.converter(last)?;
        sweep.add_notes(conv, (4, 0), (4, 7), 50, 4, None, Callback::None)?;
        sweep.add_notes(conv, (4, 7), (4, 0), 50, 4, None, Callback::None)?;
        dispatcher.add(sweep)?;

        for timer in &TIMERS {
            timer.start([true; 4]);
        }
        Ok(Self {
            board,
            dispatcher,
            clock,
            tune: TuneConfig::default(),
            vcos,
        })
    }

    fn vco(&self, n: u16) -> Result<VcoId, CommandError> {
        self.vcos
            .get(n as usize)
            .copied()
            .ok_or(CommandError::Core(vcoctl::Error::UnknownVco(n as u8)))
    }

    fn dump(&self, args: &[&str]) -> CommandResult {
        if !args.is_empty() {
            let [n] = numbers(args, "d [vco]")?;
            let conv = self.board.vco(self.vco(n)?)?.converter();
            print!("{}", conv);
            for t in 0..conv.table().len().saturating_sub(1) {
                println!("{}", conv.landmark_offsets(t as u8));
            }
            return Ok(());
        }
        print!("{}", self.board);
        for timer in &TIMERS {
            println!("{}", timer);
        }
        println!("{}", self.dispatcher);
        println!("{}", self.clock);
        Ok(())
    }

    fn tune_all(&mut self) -> CommandResult {
        for vco in self.vcos {
            let report = self.board.tune_all(vco, &self.tune, &mut self.clock)?;
            println!("VCO {}:\n{}", vco.0, report);
        }
        Ok(())
    }

    fn correct_all(&mut self) -> CommandResult {
        for vco in self.vcos {
            let result = self.board.correction_step(vco, &mut self.clock)?;
            println!("VCO {} {:?}", vco.0, result);
        }
        Ok(())
    }

    fn run_ticks(&mut self, ticks: u16) {
        let period = self.dispatcher.tick_config().period_us();
        self.dispatcher.start();
        for _ in 0..ticks {
            self.dispatcher.on_tick(&mut self.board);
            self.clock.delay_us(period);
        }
        println!("{}", self.dispatcher);
    }

    fn replace_segment(&mut self, args: [u16; 7]) -> CommandResult {
        let [n, seg, boct, bhalf, eoct, ehalf, intervals] = args;
        let env = self.dispatcher.envelope_mut(EnvelopeId(n as u8))?;
        let target = env
            .target()
            .ok_or(CommandError::Usage("envelope has no output"))?;
        let conv = self.board.converter(target)?;
        let hold = env
            .segments()
            .get(seg as usize)
            .map(|s| s.hold())
            .unwrap_or(1);
        env.replace_notes(
            conv,
            seg as usize,
            (boct as u8, bhalf as u8),
            (eoct as u8, ehalf as u8),
            intervals,
            hold,
            Callback::None,
        )?;
        env.restart();
        Ok(())
    }

    fn midi(&mut self, words: &[&str]) -> CommandResult {
        const USAGE: &str = "m <hex bytes>";
        let bytes = words
            .iter()
            .map(|w| u8::from_str_radix(w, 16))
            .collect::<Result<Vec<u8>, _>>()
            .map_err(|_| CommandError::Usage(USAGE))?;
        match MidiMessage::try_from(bytes.as_slice())? {
            MidiMessage::NoteOn(ch, note, _) => {
                let i = ch.index() as usize % VCOS;
                self.board.vmidi(DacId(i as u8), u8::from(note), false)?;
                self.dispatcher.envelope_mut(EnvelopeId(i as u8))?.restart();
            }
            MidiMessage::NoteOff(ch, _, _) => {
                CONTROLS[ch.index() as usize % VCOS].release();
            }
            other => log::info!("ignoring {:?}", other),
        }
        Ok(())
    }

    /// Run one command line.  Returns false to quit.
    fn command(&mut self, line: &str) -> Result<bool, CommandError> {
        let words: Vec<&str> = line.split_whitespace().collect();
        let Some((cmd, args)) = words.split_first() else {
            return Ok(true);
        };
        match *cmd {
            "d" => self.dump(args)?,
            "t" => self.tune_all()?,
            "c" => self.correct_all()?,
            "o" => {
                let [vco, octave, half] = numbers(args, "o <vco> <oct> <half>")?;
                let dac = self.board.vco(self.vco(vco)?)?.dac();
                self.board.voct(dac, octave as u8, half as u8, false)?;
            }
            "r" => {
                let [dac, code] = numbers(args, "r <dac> <code>")?;
                self.board.vout_raw(DacId(dac as u8), code)?;
            }
            "s" => {
                let [ticks] = numbers(args, "s <ticks>")?;
                self.run_ticks(ticks);
            }
            "x" => self.dispatcher.stop(),
            "p" => {
                let args = numbers(args, "p <env> <seg> <boct> <bhalf> <eoct> <ehalf> <intervals>")?;
                self.replace_segment(args)?;
            }
            "m" => self.midi(args)?,
            "h" | "?" => println!("{}", HELP),
            "q" => return Ok(false),
            _ => return Err(CommandError::Usage("h for help")),
        }
        Ok(true)
    }
}

fn main() -> io::Result<()> {
    colog::init();
    let mut console = match Console::new() {
        Ok(console) => console,
        Err(e) => {
            log::error!("board setup failed: {}", e);
            return Ok(());
        }
    };
    log::info!("simulated board with {} oscillators ready", VCOS);

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    loop {
        write!(stdout, "> ")?;
        stdout.flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        match console.command(&line) {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => log::error!("{}", e),
        }
    }
    Ok(())
}
